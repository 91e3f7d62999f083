//! In-memory object graph: one [`Map`] per logical volume, one [`MapNode`]
//! per fixed-size slot of it, and the process-wide registry keyed by volume
//! name.
//!
//! All of this state lives on a single thread. Mutation goes through `Cell`
//! and `RefCell`; waiting goes through per-entity `Notify` handles that are
//! signalled whenever a flag transition may unblock someone. Waiters always
//! recheck the flags after waking.

mod node;
mod registry;

pub use node::MapNode;
pub use registry::Registry;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use mapperd_error::MapperError;
use tokio::sync::Notify;

/// Fixed size of one backing object, 4 MiB.
pub const BLOCK_SIZE: u64 = 1 << 22;

/// Prefix marking a name as managed by this mapper (as opposed to a
/// read-only pithos name).
pub const MAPPER_PREFIX: &str = "archip_";

pub const MAX_TARGET_LEN: usize = 256;
pub const MAX_VOLUME_LEN: usize = MAX_TARGET_LEN;
pub const MAX_OBJECT_LEN: usize = MAPPER_PREFIX.len() + mapperd_crypto::HEX_DIGEST_SIZE;

/// pithos considers this a block full of zeros, so should we.
/// It is actually the sha256 hash of nothing.
pub const ZERO_BLOCK: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Size of a map that has been allocated but not yet loaded.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const LOADING        = 1 << 0;
        const DESTROYED      = 1 << 1;
        const WRITING        = 1 << 2;
        const DELETING       = 1 << 3;
        const DROPPING_CACHE = 1 << 4;
        const EXCLUSIVE      = 1 << 5;
        const OPENING        = 1 << 6;
        const CLOSING        = 1 << 7;
        const DELETED        = 1 << 8;
        const SNAPSHOTTING   = 1 << 9;

        const NOT_READY = Self::LOADING.bits() | Self::WRITING.bits()
            | Self::DELETING.bits() | Self::DROPPING_CACHE.bits()
            | Self::OPENING.bits() | Self::SNAPSHOTTING.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u32 {
        const EXIST        = 1 << 0;
        const COPYING      = 1 << 1;
        const WRITING      = 1 << 2;
        const DELETING     = 1 << 3;
        const DESTROYED    = 1 << 5;
        const SNAPSHOTTING = 1 << 6;

        const NOT_READY = Self::COPYING.bits() | Self::WRITING.bits()
            | Self::DELETING.bits() | Self::SNAPSHOTTING.bits();
    }
}

/// One logical volume: its identity, geometry and the index-to-node table.
pub struct Map {
    volume: String,
    version: Cell<u32>,
    size: Cell<u64>,
    flags: Cell<MapFlags>,
    objects: RefCell<HashMap<u32, Rc<MapNode>>>,
    cond: Notify,
}

impl Map {
    /// Allocate a fresh, unloaded map. The version is derived from the
    /// name: `archip_`-prefixed volumes carry the archipelago format.
    pub fn new(volume: impl Into<String>) -> Result<Rc<Map>, MapperError> {
        let volume = volume.into();
        if volume.len() > MAX_VOLUME_LEN {
            return Err(MapperError::NameTooLong(volume.len()));
        }
        let version = if volume.starts_with(MAPPER_PREFIX) { 1 } else { 0 };
        Ok(Rc::new(Map {
            volume,
            version: Cell::new(version),
            size: Cell::new(UNKNOWN_SIZE),
            flags: Cell::new(MapFlags::empty()),
            objects: RefCell::new(HashMap::new()),
            cond: Notify::new(),
        }))
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn is_archip(&self) -> bool {
        self.volume.starts_with(MAPPER_PREFIX)
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn set_version(&self, version: u32) {
        self.version.set(version);
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn set_size(&self, size: u64) {
        self.size.set(size);
    }

    /// Number of object slots covered by the current size; zero while the
    /// size is unknown.
    pub fn nr_objs(&self) -> u32 {
        if self.size.get() == UNKNOWN_SIZE {
            return 0;
        }
        (self.size.get().div_ceil(BLOCK_SIZE)) as u32
    }

    pub fn flags(&self) -> MapFlags {
        self.flags.get()
    }

    pub fn insert_flags(&self, flags: MapFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub fn remove_flags(&self, flags: MapFlags) {
        self.flags.set(self.flags.get() - flags);
    }

    pub fn is_ready(&self) -> bool {
        !self.flags.get().intersects(MapFlags::NOT_READY)
    }

    /// Park until the map leaves its `NOT_READY` states. The caller must
    /// re-resolve the map through the registry afterwards; the instance may
    /// have been destroyed while it slept.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.cond.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Wake everyone parked on this map.
    pub fn signal(&self) {
        self.cond.notify_waiters();
    }

    pub fn find_object(&self, idx: u32) -> Option<Rc<MapNode>> {
        self.objects.borrow().get(&idx).cloned()
    }

    pub fn insert_object(&self, node: Rc<MapNode>) {
        self.objects.borrow_mut().insert(node.idx(), node);
    }

    pub fn clear_objects(&self) {
        self.objects.borrow_mut().clear();
    }

    /// Shallow working copy sharing this map's nodes, used to serialize the
    /// same object table under a different name and version.
    pub fn alias(&self, volume: String, version: u32) -> Rc<Map> {
        Rc::new(Map {
            volume,
            version: Cell::new(version),
            size: Cell::new(self.size.get()),
            flags: Cell::new(MapFlags::empty()),
            objects: RefCell::new(self.objects.borrow().clone()),
            cond: Notify::new(),
        })
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("volume", &self.volume)
            .field("version", &self.version.get())
            .field("size", &self.size.get())
            .field("flags", &self.flags.get())
            .field("nr_objs", &self.nr_objs())
            .finish()
    }
}
