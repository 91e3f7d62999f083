//! Typed submit/await adapters for the blocker ports.
//!
//! Every operation follows the same pattern: build a request, submit it to
//! the port, await the completion and map a failed state to an error. The
//! transport behind a [`Port`] is externally driven; replies are routed
//! back through the oneshot bound to each submission.

use mapperd_error::MapperError;
use mapperd_serialization::{Read, Write};
use spdlog::trace;
use tokio::sync::{mpsc, oneshot};

use crate::map::BLOCK_SIZE;
use crate::xseg::{CopyPayload, Op, Reply, ReqFlags, Request, SnapshotReply};

/// One request in flight to a port, with the channel its completion is
/// delivered on.
pub struct Submission {
    pub req: Request,
    pub done: oneshot::Sender<Reply>,
}

/// Handle to one blocker port.
#[derive(Clone)]
pub struct Port {
    tx: mpsc::UnboundedSender<Submission>,
}

impl Port {
    pub fn new(tx: mpsc::UnboundedSender<Submission>) -> Port {
        Port { tx }
    }

    /// Submit a request and await its completion. Errors only on transport
    /// failure; a served-but-failed request comes back as a normal reply.
    pub async fn submit(&self, req: Request) -> Result<Reply, MapperError> {
        trace!("submitting {:?} for target {}", req.op, req.target);
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Submission { req, done })
            .map_err(|_| MapperError::Transport("port closed".into()))?;
        rx.await
            .map_err(|_| MapperError::Transport("reply channel dropped".into()))
    }
}

/// Typed operations against one blocker.
#[derive(Clone)]
pub struct BlockerClient {
    port: Port,
}

impl BlockerClient {
    pub fn new(port: Port) -> BlockerClient {
        BlockerClient { port }
    }

    fn check(reply: Reply, what: &str, target: &str) -> Result<Reply, MapperError> {
        if reply.is_served() {
            Ok(reply)
        } else {
            Err(MapperError::RequestFailed(format!("{} {}", what, target)))
        }
    }

    /// Request an exclusive lease on `target`. Without `force` the blocker
    /// may grant it without syncing.
    pub async fn acquire(&self, target: &str, force: bool) -> Result<(), MapperError> {
        let mut req = Request::new(Op::Acquire, target);
        req.size = BLOCK_SIZE;
        if !force {
            req.flags = ReqFlags::NOSYNC;
        }
        Self::check(self.port.submit(req).await?, "acquire of", target).map(|_| ())
    }

    /// Drop an exclusive lease.
    pub async fn release(&self, target: &str) -> Result<(), MapperError> {
        let req = Request::new(Op::Release, target);
        Self::check(self.port.submit(req).await?, "release of", target).map(|_| ())
    }

    /// Read one whole map blob.
    pub async fn read(&self, target: &str) -> Result<Vec<u8>, MapperError> {
        let mut req = Request::new(Op::Read, target);
        req.size = BLOCK_SIZE;
        let reply = Self::check(self.port.submit(req).await?, "read of", target)?;
        Ok(reply.data)
    }

    /// Write `data` into `target` at `offset`.
    pub async fn write(&self, target: &str, offset: u64, data: Vec<u8>) -> Result<(), MapperError> {
        let mut req = Request::new(Op::Write, target);
        req.offset = offset;
        req.size = data.len() as u64;
        req.data = data;
        Self::check(self.port.submit(req).await?, "write of", target).map(|_| ())
    }

    /// Remove `target`.
    pub async fn delete(&self, target: &str) -> Result<(), MapperError> {
        let req = Request::new(Op::Delete, target);
        Self::check(self.port.submit(req).await?, "delete of", target).map(|_| ())
    }

    /// Create `new_target` as an exclusively owned copy of `old_target`.
    pub async fn copy(&self, new_target: &str, old_target: &str) -> Result<(), MapperError> {
        let mut req = Request::new(Op::Copy, new_target);
        req.size = BLOCK_SIZE;
        req.data = CopyPayload {
            target: old_target.to_string(),
        }
        .pack()?;
        Self::check(self.port.submit(req).await?, "copy to", new_target).map(|_| ())
    }

    /// Freeze `target` and return the name minted for the snapshot object.
    pub async fn snapshot(&self, target: &str) -> Result<String, MapperError> {
        let mut req = Request::new(Op::Snapshot, target);
        req.size = BLOCK_SIZE;
        let reply = Self::check(self.port.submit(req).await?, "snapshot of", target)?;
        Ok(SnapshotReply::unpack(&reply.data)?.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xseg::ReqState;
    use tokio::task::LocalSet;

    fn port_answering(state: ReqState) -> Port {
        let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                let _ = sub.done.send(Reply {
                    state,
                    data: Vec::new(),
                });
            }
        });
        Port::new(tx)
    }

    #[tokio::test]
    async fn served_reply_is_ok() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let client = BlockerClient::new(port_answering(ReqState::Served));
                client.acquire("archip_vol", false).await.unwrap();
                client.release("archip_vol").await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn failed_reply_surfaces_as_error() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let client = BlockerClient::new(port_answering(ReqState::Failed));
                assert!(matches!(
                    client.delete("obj").await,
                    Err(MapperError::RequestFailed(_))
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn closed_port_is_a_transport_error() {
        let (tx, rx) = mpsc::unbounded_channel::<Submission>();
        drop(rx);
        let client = BlockerClient::new(Port::new(tx));
        assert!(matches!(
            client.read("archip_vol").await,
            Err(MapperError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn copy_carries_the_source_payload() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
                let client = BlockerClient::new(Port::new(tx));
                let submit = tokio::task::spawn_local(async move {
                    client.copy("archip_new", "old_object").await.unwrap();
                });
                let sub = rx.recv().await.unwrap();
                assert_eq!(sub.req.op, Op::Copy);
                assert_eq!(sub.req.target, "archip_new");
                let payload = CopyPayload::unpack(&sub.req.data).unwrap();
                assert_eq!(payload.target, "old_object");
                sub.done.send(Reply::served(Vec::new())).unwrap();
                submit.await.unwrap();
            })
            .await;
    }
}
