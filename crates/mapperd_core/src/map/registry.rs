use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use mapperd_error::MapperError;
use spdlog::debug;

use super::Map;

/// Process-wide table of live maps, keyed by volume name. At most one map
/// per volume exists at any instant.
#[derive(Default)]
pub struct Registry {
    maps: RefCell<HashMap<String, Rc<Map>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn find(&self, volume: &str) -> Option<Rc<Map>> {
        self.maps.borrow().get(volume).cloned()
    }

    pub fn insert(&self, map: &Rc<Map>) -> Result<(), MapperError> {
        let mut maps = self.maps.borrow_mut();
        if maps.contains_key(map.volume()) {
            return Err(MapperError::VolumeExists(map.volume().to_string()));
        }
        debug!("inserting map {} into registry", map.volume());
        maps.insert(map.volume().to_string(), map.clone());
        Ok(())
    }

    pub fn remove(&self, volume: &str) -> Option<Rc<Map>> {
        debug!("removing map {} from registry", volume);
        self.maps.borrow_mut().remove(volume)
    }

    /// Snapshot of all live maps, for the shutdown sweep.
    pub fn all(&self) -> Vec<Rc<Map>> {
        self.maps.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = Registry::new();
        let map = Map::new("archip_vol").unwrap();
        registry.insert(&map).unwrap();
        let dup = Map::new("archip_vol").unwrap();
        assert!(matches!(
            registry.insert(&dup),
            Err(MapperError::VolumeExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_then_reinsert() {
        let registry = Registry::new();
        let map = Map::new("archip_vol").unwrap();
        registry.insert(&map).unwrap();
        assert!(registry.remove("archip_vol").is_some());
        assert!(registry.find("archip_vol").is_none());
        registry.insert(&map).unwrap();
    }
}
