//! Range resolution and copy-up: turning `(offset, size)` into object
//! segments, materializing exclusively owned copies of shared objects
//! before a write may touch them.

use std::rc::Rc;

use mapperd_crypto::Digest;
use mapperd_error::MapperError;
use spdlog::{debug, info, warn};
use tokio::task::spawn_local;

use super::{Mapper, Mio};
use crate::format::Record;
use crate::map::{BLOCK_SIZE, MAPPER_PREFIX, Map, MapNode, NodeFlags, ZERO_BLOCK};
use crate::xseg::{MapReply, MapSegment};

/// Deterministic name for the exclusively owned copy of object `idx` of
/// `volume`. Restarting a copy-up always lands on the same target, which
/// makes it idempotent under retry.
pub fn copyup_name(volume: &str, idx: u32) -> String {
    let digest = Digest::hash(format!("{}_{}", volume, idx));
    format!("{}{}", MAPPER_PREFIX, digest.to_hex())
}

struct RangeSlice {
    node: Rc<MapNode>,
    offset: u64,
    size: u64,
}

impl Mapper {
    /// Resolve a byte range to object segments. In write mode, every node
    /// still pointing at a shared object is copied up first.
    pub(super) async fn req_to_objs(
        self: &Rc<Self>,
        map: &Rc<Map>,
        offset: u64,
        size: u64,
        write: bool,
    ) -> Result<MapReply, MapperError> {
        let slices = Self::slice_range(map, offset, size)?;
        debug!(
            "resolved {} slices for map {}, range {}-{}",
            slices.len(),
            map.volume(),
            offset,
            offset + size
        );

        if write {
            let mio = Mio::new();
            // First scan: issue as many copy-ups as possible without
            // blocking; anything not ready is left to the second scan.
            for slice in &slices {
                if mio.err() {
                    break;
                }
                if !slice.node.is_ready() {
                    continue;
                }
                if !slice.node.exists() {
                    self.start_copyup(&slice.node, &mio);
                }
            }
            // Second scan: this time wait for busy objects, then copy up
            // whatever still is not owned.
            for slice in &slices {
                if mio.err() {
                    break;
                }
                if !slice.node.is_ready() {
                    slice.node.wait_ready().await;
                    if slice.node.flags().contains(NodeFlags::DESTROYED) {
                        mio.set_err();
                        continue;
                    }
                }
                if !slice.node.exists() {
                    self.start_copyup(&slice.node, &mio);
                }
            }
            mio.drain().await;
            if mio.err() {
                return Err(MapperError::RequestFailed(format!(
                    "copy-up on map {}",
                    map.volume()
                )));
            }
        }

        Ok(MapReply {
            segs: slices
                .iter()
                .map(|s| MapSegment {
                    target: s.node.object(),
                    offset: s.offset,
                    size: s.size,
                })
                .collect(),
        })
    }

    /// Cut `(offset, size)` along object boundaries. The first slice may
    /// start inside its object and the last may end short; everything in
    /// between spans a whole object.
    fn slice_range(map: &Rc<Map>, offset: u64, size: u64) -> Result<Vec<RangeSlice>, MapperError> {
        let mut slices = Vec::new();
        let mut obj_index = (offset / BLOCK_SIZE) as u32;
        let mut obj_offset = offset & (BLOCK_SIZE - 1);
        let mut rem_size = size;
        loop {
            let obj_size = rem_size.min(BLOCK_SIZE - obj_offset);
            let node = map
                .find_object(obj_index)
                .ok_or(MapperError::ObjectNotFound(obj_index))?;
            slices.push(RangeSlice {
                node,
                offset: obj_offset,
                size: obj_size,
            });
            rem_size -= obj_size;
            if rem_size == 0 {
                return Ok(slices);
            }
            obj_index += 1;
            obj_offset = 0;
        }
    }

    /// Kick off a copy-up of one node. The node is flagged busy before the
    /// task first runs, so a rescan never starts it twice.
    fn start_copyup(self: &Rc<Self>, node: &Rc<MapNode>, mio: &Rc<Mio>) {
        let new_object = match node.map() {
            Some(map) => copyup_name(map.volume(), node.idx()),
            None => {
                warn!("object {} has no map back pointer", node.object());
                mio.set_err();
                return;
            }
        };
        // Copying up the zero block is not needed; only the map record is
        // written.
        let skip_copy = node.object() == ZERO_BLOCK;
        if skip_copy {
            node.insert_flags(NodeFlags::WRITING);
        } else {
            info!("copying up object {} to {}", node.object(), new_object);
            node.insert_flags(NodeFlags::COPYING);
        }
        mio.inc_pending();

        let mapper = self.clone();
        let node = node.clone();
        let mio = mio.clone();
        spawn_local(async move {
            if let Err(e) = Self::copyup_object(&mapper, &node, new_object, skip_copy).await {
                warn!("copy-up of object {} failed: {}", node.object(), e);
                mio.set_err();
            }
            node.signal();
            mio.dec_pending();
        });
    }

    async fn copyup_object(
        mapper: &Rc<Mapper>,
        node: &Rc<MapNode>,
        new_object: String,
        skip_copy: bool,
    ) -> Result<(), MapperError> {
        let map = node
            .map()
            .ok_or_else(|| MapperError::RequestFailed("object lost its map".to_string()))?;

        if !skip_copy {
            let r = mapper.data.copy(&new_object, &node.object()).await;
            node.remove_flags(NodeFlags::COPYING);
            r?;
            if node.flags().contains(NodeFlags::DESTROYED) {
                return Err(MapperError::MapDestroyed(map.volume().to_string()));
            }
            node.insert_flags(NodeFlags::WRITING);
        }

        let r = mapper
            .object_write(
                &map,
                node.idx(),
                &Record {
                    object: new_object.clone(),
                    exist: true,
                },
            )
            .await;
        node.remove_flags(NodeFlags::WRITING);
        r?;
        if node.flags().contains(NodeFlags::DESTROYED) {
            return Err(MapperError::MapDestroyed(map.volume().to_string()));
        }

        node.set_flags(NodeFlags::EXIST);
        node.set_object(new_object);
        info!("object write of {} completed", node.object());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copyup_name_is_deterministic() {
        let a = copyup_name("archip_vol", 0);
        let b = copyup_name("archip_vol", 0);
        assert_eq!(a, b);
        assert_ne!(a, copyup_name("archip_vol", 1));
        assert_ne!(a, copyup_name("archip_vol2", 0));
        assert!(a.starts_with(MAPPER_PREFIX));
        assert_eq!(a.len(), MAPPER_PREFIX.len() + 64);
    }

    #[test]
    fn copyup_name_hashes_volume_and_index() {
        let expected = Digest::hash("vol_7").to_hex();
        assert_eq!(copyup_name("vol", 7), format!("{}{}", MAPPER_PREFIX, expected));
    }
}
