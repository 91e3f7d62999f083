//! The mapper state machine: one cooperative task per incoming request,
//! serialized against each other through the map and object flag sets.

mod cache;
mod clone;
mod destroy;
mod resolve;
mod snapshot;

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;
use mapperd_error::MapperError;
use mapperd_serialization::{Read, Write};
use spdlog::info;
use tokio::sync::Notify;

use crate::blocker::BlockerClient;
use crate::map::{Map, MapFlags, Registry};
use crate::xseg::{ClonePayload, InfoReply, MapReply, Op, Request, SnapshotReply};

bitflags! {
    /// Lookup behavior for [`Mapper::get_map`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct GetFlags: u32 {
        /// Create and load the map on a registry miss.
        const LOAD      = 1 << 0;
        /// Try to take the exclusive lease while loading.
        const EXCLUSIVE = 1 << 1;
        /// Demand a synced lease and treat acquire failure as fatal.
        const FORCE     = 1 << 2;
    }
}

/// Per-request io state: the count of blocker sub-requests still in flight
/// and the sticky error flag they report through.
pub(crate) struct Mio {
    pending: Cell<u64>,
    err: Cell<bool>,
    cond: Notify,
}

impl Mio {
    pub(crate) fn new() -> Rc<Mio> {
        Rc::new(Mio {
            pending: Cell::new(0),
            err: Cell::new(false),
            cond: Notify::new(),
        })
    }

    pub(crate) fn err(&self) -> bool {
        self.err.get()
    }

    pub(crate) fn set_err(&self) {
        self.err.set(true);
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.set(self.pending.get() + 1);
    }

    pub(crate) fn dec_pending(&self) {
        self.pending.set(self.pending.get() - 1);
        self.cond.notify_waiters();
    }

    /// Wait until every sub-request has completed.
    pub(crate) async fn drain(&self) {
        loop {
            let notified = self.cond.notified();
            if self.pending.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until there is room for another sub-request under `cap`.
    pub(crate) async fn throttle(&self, cap: u64) {
        loop {
            let notified = self.cond.notified();
            if self.pending.get() < cap {
                return;
            }
            notified.await;
        }
    }
}

/// Typed payload of a successful reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyData {
    None,
    Map(MapReply),
    Info(InfoReply),
    Snapshot(SnapshotReply),
}

impl ReplyData {
    pub fn encode(&self) -> Result<Vec<u8>, MapperError> {
        Ok(match self {
            ReplyData::None => Vec::new(),
            ReplyData::Map(reply) => reply.pack()?,
            ReplyData::Info(reply) => reply.pack()?,
            ReplyData::Snapshot(reply) => reply.pack()?,
        })
    }
}

pub struct Mapper {
    registry: Registry,
    /// Blocker that accesses data objects.
    data: BlockerClient,
    /// Blocker that accesses map blobs.
    mapb: BlockerClient,
    /// In-flight cap for the snapshot and destroy sweeps.
    nr_ops: u64,
}

impl Mapper {
    pub fn new(data: BlockerClient, mapb: BlockerClient, nr_ops: u64) -> Rc<Mapper> {
        Rc::new(Mapper {
            registry: Registry::new(),
            data,
            mapb,
            nr_ops: nr_ops.max(1),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one incoming request to completion.
    pub async fn handle(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        match req.op {
            Op::Clone => self.handle_clone(req).await,
            Op::MapRead => self.handle_mapr(req).await,
            Op::MapWrite => self.handle_mapw(req).await,
            Op::Snapshot => self.handle_snapshot(req).await,
            Op::Info => self.handle_info(req).await,
            Op::Delete => self.handle_destroy(req).await,
            Op::Open => self.handle_open(req).await,
            Op::Close => self.handle_close(req).await,
            other => Err(MapperError::RequestFailed(format!(
                "unhandled operation {:?}",
                other
            ))),
        }
    }

    /// Resolve a ready map, waiting out `NOT_READY` states. Every wake-up
    /// retries from the registry lookup; the instance observed before the
    /// wait may be gone by the time it fires.
    async fn ready_map(
        self: &Rc<Self>,
        name: &str,
        flags: GetFlags,
    ) -> Result<Rc<Map>, MapperError> {
        loop {
            let map = self.get_map(name, flags).await?;
            if map.is_ready() {
                return Ok(map);
            }
            map.wait_ready().await;
        }
    }

    /// Common epilogue: a map that is not held exclusively is not cached.
    async fn finish_map(self: &Rc<Self>, map: &Rc<Map>) {
        if !map
            .flags()
            .intersects(MapFlags::EXCLUSIVE | MapFlags::DESTROYED)
        {
            self.do_dropcache(map).await;
        }
        map.signal();
    }

    async fn handle_mapr(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(&req.target, GetFlags::LOAD | GetFlags::EXCLUSIVE)
            .await?;
        let r = self.req_to_objs(&map, req.offset, req.size, false).await;
        self.finish_map(&map).await;
        r.map(ReplyData::Map)
    }

    async fn handle_mapw(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(
                &req.target,
                GetFlags::LOAD | GetFlags::EXCLUSIVE | GetFlags::FORCE,
            )
            .await?;
        let r = self.req_to_objs(&map, req.offset, req.size, true).await;
        self.finish_map(&map).await;
        r.map(ReplyData::Map)
    }

    async fn handle_info(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self.ready_map(&req.target, GetFlags::LOAD).await?;
        let size = map.size();
        self.finish_map(&map).await;
        Ok(ReplyData::Info(InfoReply { size }))
    }

    async fn handle_open(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(&req.target, GetFlags::LOAD | GetFlags::EXCLUSIVE)
            .await?;
        // Opening succeeds only if the lease was actually granted; the map
        // then stays cached until a close.
        let r = if map.flags().contains(MapFlags::EXCLUSIVE) {
            Ok(ReplyData::None)
        } else {
            Err(MapperError::NotExclusive(map.volume().to_string()))
        };
        self.finish_map(&map).await;
        r
    }

    async fn handle_close(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(&req.target, GetFlags::EXCLUSIVE | GetFlags::FORCE)
            .await?;
        let r = self.do_close(&map).await;
        self.finish_map(&map).await;
        r.map(|_| ReplyData::None)
    }

    async fn handle_snapshot(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(&req.target, GetFlags::LOAD | GetFlags::EXCLUSIVE)
            .await?;
        let r = self.do_snapshot(&map).await;
        self.finish_map(&map).await;
        r.map(ReplyData::Snapshot)
    }

    async fn handle_destroy(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let map = self
            .ready_map(&req.target, GetFlags::LOAD | GetFlags::EXCLUSIVE)
            .await?;
        let r = self.do_destroy(&map).await;
        self.finish_map(&map).await;
        r.map(|_| ReplyData::None)
    }

    async fn handle_clone(self: &Rc<Self>, req: &Request) -> Result<ReplyData, MapperError> {
        let params = ClonePayload::unpack(&req.data)?;
        if params.target.is_empty() {
            info!("creating volume {}", req.target);
            return self
                .create_volume(&req.target, params.size)
                .await
                .map(|_| ReplyData::None);
        }
        let parent = self.ready_map(&params.target, GetFlags::LOAD).await?;
        let r = self.do_clone(&parent, &req.target, params.size).await;
        self.finish_map(&parent).await;
        r.map(|_| ReplyData::None)
    }

    /// Shutdown sweep: release every exclusively held lease.
    pub async fn finalize(&self) {
        for map in self.registry.all() {
            if !map.flags().contains(MapFlags::EXCLUSIVE) {
                continue;
            }
            info!("closing map {} on shutdown", map.volume());
            map.insert_flags(MapFlags::CLOSING);
            if let Err(e) = self.mapb.release(map.volume()).await {
                spdlog::error!("couldn't close map {}: {}", map.volume(), e);
            }
            map.remove_flags(MapFlags::CLOSING | MapFlags::EXCLUSIVE);
        }
    }
}
