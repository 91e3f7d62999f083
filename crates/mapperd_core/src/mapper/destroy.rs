//! Destruction: delete the map blob, then sweep the backing objects.

use std::rc::Rc;

use mapperd_error::MapperError;
use spdlog::{info, warn};
use tokio::task::spawn_local;

use super::{Mapper, Mio};
use crate::map::{Map, MapFlags, NodeFlags};

impl Mapper {
    /// Destroy an exclusively held map: remove the blob, then every owned
    /// backing object. Object deletions that fail leave orphans behind;
    /// there is no garbage collection to reclaim them, so they are only
    /// logged.
    pub(super) async fn do_destroy(self: &Rc<Self>, map: &Rc<Map>) -> Result<(), MapperError> {
        if !map.flags().contains(MapFlags::EXCLUSIVE) {
            warn!("map {} was not opened exclusively", map.volume());
            return Err(MapperError::NotExclusive(map.volume().to_string()));
        }
        info!("destroying map {}", map.volume());

        map.insert_flags(MapFlags::DELETING);
        if let Err(e) = self.mapb.delete(map.volume()).await {
            map.remove_flags(MapFlags::DELETING);
            return Err(e);
        }

        let mio = Mio::new();
        for idx in 0..map.nr_objs() {
            // Throttle in-flight deletions to the configured cap.
            mio.throttle(self.nr_ops).await;

            let Some(node) = map.find_object(idx) else {
                continue;
            };
            if node.flags().contains(NodeFlags::DESTROYED) {
                continue;
            }
            if !node.exists() {
                // Shared objects are not ours to delete.
                node.insert_flags(NodeFlags::DESTROYED);
                continue;
            }
            node.wait_ready().await;

            node.insert_flags(NodeFlags::DELETING);
            mio.inc_pending();
            let mapper = self.clone();
            let mio_task = mio.clone();
            spawn_local(async move {
                let object = node.object();
                let r = mapper.data.delete(&object).await;
                node.remove_flags(NodeFlags::DELETING);
                node.insert_flags(NodeFlags::DESTROYED);
                if let Err(e) = r {
                    warn!("deletion of object {} failed: {}", object, e);
                    mio_task.set_err();
                }
                node.signal();
                mio_task.dec_pending();
            });
        }
        mio.drain().await;

        map.remove_flags(MapFlags::DELETING);
        map.insert_flags(MapFlags::DELETED);
        info!("destroyed map {}", map.volume());
        self.do_close(map).await
    }
}
