//! Clones and fresh volumes.

use std::rc::Rc;

use mapperd_error::MapperError;
use spdlog::{info, warn};

use super::Mapper;
use crate::format::MAX_VOLUME_SIZE;
use crate::map::{Map, MapNode, NodeFlags, ZERO_BLOCK};

impl Mapper {
    /// Create a copy-on-write clone of `parent` under `child_name`. A size
    /// of `u64::MAX` inherits the parent's; shrinking below the parent is
    /// rejected. Every child record points at the parent's object (or the
    /// zero block) as a shared source.
    pub(super) async fn do_clone(
        self: &Rc<Self>,
        parent: &Rc<Map>,
        child_name: &str,
        size: u64,
    ) -> Result<(), MapperError> {
        info!("cloning map {} into {}", parent.volume(), child_name);
        let child = self.create_archip_map(child_name)?;
        let r = self.populate_clone(parent, &child, size).await;
        if let Err(e) = self.do_close(&child).await {
            warn!("cannot close map {}: {}", child.volume(), e);
        }
        r
    }

    async fn populate_clone(
        self: &Rc<Self>,
        parent: &Rc<Map>,
        child: &Rc<Map>,
        size: u64,
    ) -> Result<(), MapperError> {
        self.assert_new_volume(child).await?;

        let size = if size == u64::MAX { parent.size() } else { size };
        if size < parent.size() {
            warn!(
                "requested clone size {} < map size {} for clone {}",
                size,
                parent.size(),
                child.volume()
            );
            return Err(MapperError::InvalidSize(size));
        }
        if size > MAX_VOLUME_SIZE {
            return Err(MapperError::SizeTooLarge {
                requested: size,
                max: MAX_VOLUME_SIZE,
            });
        }
        child.set_size(size);

        for idx in 0..child.nr_objs() {
            let object = match parent.find_object(idx) {
                Some(node) => node.object(),
                None => ZERO_BLOCK.to_string(),
            };
            child.insert_object(MapNode::new(idx, object, NodeFlags::empty(), child));
        }
        self.write_map(child).await
    }

    /// Create a fresh archipelago volume backed entirely by zero blocks.
    pub(super) async fn create_volume(
        self: &Rc<Self>,
        name: &str,
        size: u64,
    ) -> Result<(), MapperError> {
        if size == 0 {
            warn!("cannot create volume {}: size not specified", name);
            return Err(MapperError::InvalidSize(0));
        }
        if size > MAX_VOLUME_SIZE {
            return Err(MapperError::SizeTooLarge {
                requested: size,
                max: MAX_VOLUME_SIZE,
            });
        }

        let map = self.create_archip_map(name)?;
        let r = self.populate_volume(&map, size).await;
        if let Err(e) = self.do_close(&map).await {
            warn!("cannot close map {}: {}", map.volume(), e);
        }
        match &r {
            Ok(()) => info!("volume {} created", map.volume()),
            Err(e) => warn!("volume creation for {} failed: {}", map.volume(), e),
        }
        r
    }

    async fn populate_volume(self: &Rc<Self>, map: &Rc<Map>, size: u64) -> Result<(), MapperError> {
        self.assert_new_volume(map).await?;
        map.set_size(size);
        for idx in 0..map.nr_objs() {
            map.insert_object(MapNode::new(
                idx,
                ZERO_BLOCK.to_string(),
                NodeFlags::empty(),
                map,
            ));
        }
        self.write_map(map).await
    }

    /// Take the lease on a map that must not exist yet: the acquire has to
    /// succeed and the following load has to come back empty.
    async fn assert_new_volume(self: &Rc<Self>, map: &Rc<Map>) -> Result<(), MapperError> {
        if self.open_map(map, false).await.is_err() {
            warn!("target volume {} exists", map.volume());
            return Err(MapperError::VolumeExists(map.volume().to_string()));
        }
        if self.load_map(map).await.is_ok() {
            warn!("target volume {} exists", map.volume());
            return Err(MapperError::VolumeExists(map.volume().to_string()));
        }
        Ok(())
    }
}
