use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::Notify;

use super::{Map, NodeFlags};

/// One object slot of a map: the byte range
/// `[idx * BLOCK_SIZE, (idx + 1) * BLOCK_SIZE)` of the volume and the name
/// of the backing object it currently resolves to.
///
/// The back-pointer to the owning map is weak; a node never outlives its
/// map, and a strong pointer would cycle.
pub struct MapNode {
    idx: u32,
    object: RefCell<String>,
    flags: Cell<NodeFlags>,
    map: Weak<Map>,
    cond: Notify,
}

impl MapNode {
    pub fn new(idx: u32, object: String, flags: NodeFlags, map: &Rc<Map>) -> Rc<MapNode> {
        Rc::new(MapNode {
            idx,
            object: RefCell::new(object),
            flags: Cell::new(flags),
            map: Rc::downgrade(map),
            cond: Notify::new(),
        })
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn object(&self) -> String {
        self.object.borrow().clone()
    }

    pub fn set_object(&self, name: String) {
        *self.object.borrow_mut() = name;
    }

    pub fn map(&self) -> Option<Rc<Map>> {
        self.map.upgrade()
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags.get()
    }

    pub fn set_flags(&self, flags: NodeFlags) {
        self.flags.set(flags);
    }

    pub fn insert_flags(&self, flags: NodeFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub fn remove_flags(&self, flags: NodeFlags) {
        self.flags.set(self.flags.get() - flags);
    }

    pub fn exists(&self) -> bool {
        self.flags.get().contains(NodeFlags::EXIST)
    }

    pub fn is_ready(&self) -> bool {
        !self.flags.get().intersects(NodeFlags::NOT_READY)
    }

    /// Park until no operation is in flight on this object. Callers recheck
    /// the flags afterwards; the node may have been destroyed meanwhile.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.cond.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Wake everyone parked on this object.
    pub fn signal(&self) {
        self.cond.notify_waiters();
    }
}

impl fmt::Debug for MapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapNode")
            .field("idx", &self.idx)
            .field("object", &*self.object.borrow())
            .field("flags", &self.flags.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ZERO_BLOCK;

    #[test]
    fn back_pointer_does_not_keep_map_alive() {
        let map = Map::new("archip_vol").unwrap();
        let node = MapNode::new(0, ZERO_BLOCK.into(), NodeFlags::empty(), &map);
        assert!(node.map().is_some());
        drop(map);
        assert!(node.map().is_none());
    }

    #[test]
    fn flag_updates() {
        let map = Map::new("archip_vol").unwrap();
        let node = MapNode::new(3, ZERO_BLOCK.into(), NodeFlags::empty(), &map);
        assert!(node.is_ready());
        node.insert_flags(NodeFlags::COPYING);
        assert!(!node.is_ready());
        node.remove_flags(NodeFlags::COPYING);
        node.insert_flags(NodeFlags::EXIST);
        assert!(node.is_ready());
        assert!(node.exists());
    }
}
