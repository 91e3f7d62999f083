//! Map lifecycle: lookup and creation, lease handling, blob load/store and
//! cache eviction.

use std::rc::Rc;

use mapperd_error::MapperError;
use spdlog::{debug, info, warn};

use super::{GetFlags, Mapper};
use crate::format::{self, Record, codec_for};
use crate::map::{MAPPER_PREFIX, Map, MapFlags};

impl Mapper {
    /// Look up a map, creating and loading it on a miss when `LOAD` is set.
    /// A destroyed map is never handed out.
    pub(super) async fn get_map(
        self: &Rc<Self>,
        name: &str,
        flags: GetFlags,
    ) -> Result<Rc<Map>, MapperError> {
        if let Some(map) = self.registry.find(name) {
            if map.flags().contains(MapFlags::DESTROYED) {
                return Err(MapperError::MapDestroyed(name.to_string()));
            }
            return Ok(map);
        }
        if !flags.contains(GetFlags::LOAD) {
            return Err(MapperError::VolumeNotFound(name.to_string()));
        }
        let map = Map::new(name)?;
        self.registry.insert(&map)?;
        if let Err(e) = self.open_load_map(&map, flags).await {
            self.do_dropcache(&map).await;
            return Err(e);
        }
        Ok(map)
    }

    /// Mint a fresh archipelago map for `name` and register it.
    pub(super) fn create_archip_map(&self, name: &str) -> Result<Rc<Map>, MapperError> {
        let map = Map::new(format!("{}{}", MAPPER_PREFIX, name))?;
        self.registry.insert(&map)?;
        Ok(map)
    }

    /// Acquire the lease (when asked to) and load the blob. A failed
    /// acquire is tolerated unless `FORCE` demanded a synced one; a failed
    /// load releases a lease it just took.
    pub(super) async fn open_load_map(
        self: &Rc<Self>,
        map: &Rc<Map>,
        flags: GetFlags,
    ) -> Result<(), MapperError> {
        let mut opened = false;
        if flags.contains(GetFlags::EXCLUSIVE) {
            match self.open_map(map, flags.contains(GetFlags::FORCE)).await {
                Ok(()) => opened = true,
                Err(e) => {
                    if flags.contains(GetFlags::FORCE) {
                        return Err(e);
                    }
                    debug!("map {} opened without exclusive access", map.volume());
                }
            }
        }
        if let Err(e) = self.load_map(map).await {
            if opened {
                if let Err(close_err) = self.close_map(map).await {
                    warn!("cannot close map {}: {}", map.volume(), close_err);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub(super) async fn open_map(&self, map: &Rc<Map>, force: bool) -> Result<(), MapperError> {
        info!("opening map {}", map.volume());
        map.insert_flags(MapFlags::OPENING);
        let r = self.mapb.acquire(map.volume(), force).await;
        map.remove_flags(MapFlags::OPENING);
        r?;
        map.insert_flags(MapFlags::EXCLUSIVE);
        Ok(())
    }

    pub(super) async fn close_map(&self, map: &Rc<Map>) -> Result<(), MapperError> {
        info!("closing map {}", map.volume());
        map.insert_flags(MapFlags::CLOSING);
        let r = self.mapb.release(map.volume()).await;
        map.remove_flags(MapFlags::CLOSING);
        r?;
        map.remove_flags(MapFlags::EXCLUSIVE);
        Ok(())
    }

    pub(super) async fn load_map(&self, map: &Rc<Map>) -> Result<(), MapperError> {
        info!("loading map {}", map.volume());
        map.insert_flags(MapFlags::LOADING);
        let r = self.mapb.read(map.volume()).await;
        map.remove_flags(MapFlags::LOADING);
        let data = r?;
        format::read_map(map, &data)?;
        info!("map {} loaded, size {}", map.volume(), map.size());
        Ok(())
    }

    /// Serialize and store the whole map blob.
    pub(super) async fn write_map(&self, map: &Rc<Map>) -> Result<(), MapperError> {
        info!("writing map {}", map.volume());
        map.insert_flags(MapFlags::WRITING);
        let r = match codec_for(map.version()).and_then(|codec| codec.write_map(map)) {
            Ok(blob) => self.mapb.write(map.volume(), 0, blob).await,
            Err(e) => Err(e),
        };
        map.remove_flags(MapFlags::WRITING);
        r
    }

    /// Rewrite a single object record within the map blob.
    pub(super) async fn object_write(
        &self,
        map: &Rc<Map>,
        idx: u32,
        record: &Record,
    ) -> Result<(), MapperError> {
        debug!(
            "writing object {} of map {} [{}]",
            record.object,
            map.volume(),
            idx
        );
        let codec = codec_for(map.version())?;
        let data = codec.encode_record(record)?;
        self.mapb
            .write(map.volume(), codec.record_offset(idx), data)
            .await
    }

    /// Evict a map: wait out every pending object operation, mark the nodes
    /// destroyed and drop the map from the registry.
    pub(super) async fn do_dropcache(self: &Rc<Self>, map: &Rc<Map>) {
        use crate::map::NodeFlags;

        info!("dropping cache for map {}", map.volume());
        map.insert_flags(MapFlags::DROPPING_CACHE);
        for idx in 0..map.nr_objs() {
            if let Some(node) = map.find_object(idx) {
                if !node.flags().contains(NodeFlags::DESTROYED) {
                    node.wait_ready().await;
                    node.insert_flags(NodeFlags::DESTROYED);
                }
            }
        }
        map.clear_objects();
        map.remove_flags(MapFlags::DROPPING_CACHE);
        map.insert_flags(MapFlags::DESTROYED);
        self.registry.remove(map.volume());
        map.signal();
        info!("dropped cache for map {}", map.volume());
    }

    /// Release the lease (when held) and evict. A failed release is fatal
    /// only if the map's blob still exists.
    pub(super) async fn do_close(self: &Rc<Self>, map: &Rc<Map>) -> Result<(), MapperError> {
        if map.flags().contains(MapFlags::EXCLUSIVE) {
            if let Err(e) = self.close_map(map).await {
                if !map.flags().contains(MapFlags::DELETED) {
                    return Err(e);
                }
                warn!("ignoring failed close of deleted map {}", map.volume());
            }
        }
        self.do_dropcache(map).await;
        Ok(())
    }
}
