//! Snapshotting: freeze every owned object, then publish the map under its
//! content address.

use std::rc::Rc;

use mapperd_crypto::merkle;
use mapperd_error::MapperError;
use spdlog::{info, warn};
use tokio::task::spawn_local;

use super::{Mapper, Mio};
use crate::format::{Record, object_digest};
use crate::map::{Map, MapFlags, MapNode, NodeFlags};
use crate::xseg::SnapshotReply;

impl Mapper {
    /// Snapshot an exclusively held map. Every owned object is frozen into
    /// a shared snapshot object, then the whole map is written out as a
    /// version-0 blob named by the Merkle root of its records. The reply
    /// carries that name.
    pub(super) async fn do_snapshot(
        self: &Rc<Self>,
        map: &Rc<Map>,
    ) -> Result<SnapshotReply, MapperError> {
        if !map.flags().contains(MapFlags::EXCLUSIVE) {
            warn!("map {} was not opened exclusively", map.volume());
            return Err(MapperError::NotExclusive(map.volume().to_string()));
        }
        info!("starting snapshot for map {}", map.volume());
        map.insert_flags(MapFlags::SNAPSHOTTING);
        let r = self.snapshot_objects(map).await;
        map.remove_flags(MapFlags::SNAPSHOTTING);
        match &r {
            Ok(reply) => info!(
                "snapshot for map {} completed as {}",
                map.volume(),
                reply.target
            ),
            Err(e) => warn!("snapshot for map {} failed: {}", map.volume(), e),
        }
        r
    }

    async fn snapshot_objects(
        self: &Rc<Self>,
        map: &Rc<Map>,
    ) -> Result<SnapshotReply, MapperError> {
        let mio = Mio::new();
        for idx in 0..map.nr_objs() {
            // Throttle in-flight snapshots to the configured cap.
            mio.throttle(self.nr_ops).await;

            let Some(node) = map.find_object(idx) else {
                continue;
            };
            if !node.exists() {
                continue;
            }
            node.wait_ready().await;
            if node.flags().contains(NodeFlags::DESTROYED) {
                continue;
            }

            node.insert_flags(NodeFlags::SNAPSHOTTING);
            mio.inc_pending();
            let mapper = self.clone();
            let mio_task = mio.clone();
            spawn_local(async move {
                match Self::snapshot_object(&mapper, &node).await {
                    Ok(old_object) => {
                        node.signal();
                        // The snapshot is captured; losing the old object
                        // only leaks it.
                        if let Err(e) = mapper.data.delete(&old_object).await {
                            warn!("cannot delete old object {}: {}", old_object, e);
                        }
                    }
                    Err(e) => {
                        warn!("snapshot of object {} failed: {}", node.object(), e);
                        mio_task.set_err();
                        node.signal();
                    }
                }
                mio_task.dec_pending();
            });
        }
        mio.drain().await;
        if mio.err() {
            return Err(MapperError::RequestFailed(format!(
                "snapshot of map {}",
                map.volume()
            )));
        }

        // The snapshot's identity is the Merkle root of its version-0
        // records, computed over the now-frozen object table.
        let mut digests = Vec::with_capacity(map.nr_objs() as usize);
        for idx in 0..map.nr_objs() {
            let node = map
                .find_object(idx)
                .ok_or(MapperError::ObjectNotFound(idx))?;
            digests.push(object_digest(&node.object())?);
        }
        let name = merkle(&digests).to_hex();

        let frozen = map.alias(name.clone(), 0);
        self.write_map(&frozen).await?;
        Ok(SnapshotReply { target: name })
    }

    /// Freeze one object: ask the data blocker for a snapshot name, adopt
    /// it in the map record and in memory, and hand back the old name for
    /// deletion.
    async fn snapshot_object(
        mapper: &Rc<Mapper>,
        node: &Rc<MapNode>,
    ) -> Result<String, MapperError> {
        let map = node
            .map()
            .ok_or_else(|| MapperError::RequestFailed("object lost its map".to_string()))?;

        let r = mapper.data.snapshot(&node.object()).await;
        node.remove_flags(NodeFlags::SNAPSHOTTING);
        let new_object = r?;

        node.insert_flags(NodeFlags::WRITING);
        let r = mapper
            .object_write(
                &map,
                node.idx(),
                &Record {
                    object: new_object.clone(),
                    exist: false,
                },
            )
            .await;
        node.remove_flags(NodeFlags::WRITING);
        r?;

        let old_object = node.object();
        node.remove_flags(NodeFlags::EXIST);
        node.set_object(new_object);
        info!("object {} snapshotted as {}", old_object, node.object());
        Ok(old_object)
    }
}
