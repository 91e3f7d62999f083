//! Request dispatch: one cooperative task per accepted request, a runnable
//! gauge so shutdown can tell when nothing is left in flight, and the
//! closing sweep that releases every held lease.

use std::cell::Cell;
use std::rc::Rc;

use spdlog::{debug, error, warn};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::spawn_local;

use crate::mapper::Mapper;
use crate::xseg::{Op, Reply, Request};

/// One accepted request and the channel its completion goes out on.
pub struct Incoming {
    pub req: Request,
    pub done: oneshot::Sender<Reply>,
}

/// Count of live handler tasks. Shutdown waits for it to reach zero so no
/// task is orphaned mid-flight.
struct TaskGauge {
    count: Cell<u64>,
    cond: Notify,
}

impl TaskGauge {
    fn enter(&self) {
        self.count.set(self.count.get() + 1);
    }

    fn leave(&self) {
        self.count.set(self.count.get() - 1);
        self.cond.notify_waiters();
    }

    async fn quiesce(&self) {
        loop {
            let notified = self.cond.notified();
            if self.count.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct Dispatcher {
    mapper: Rc<Mapper>,
    tasks: Rc<TaskGauge>,
}

fn is_mapper_op(op: Op) -> bool {
    matches!(
        op,
        Op::Clone
            | Op::MapRead
            | Op::MapWrite
            | Op::Snapshot
            | Op::Info
            | Op::Delete
            | Op::Open
            | Op::Close
    )
}

impl Dispatcher {
    pub fn new(mapper: Rc<Mapper>) -> Dispatcher {
        Dispatcher {
            mapper,
            tasks: Rc::new(TaskGauge {
                count: Cell::new(0),
                cond: Notify::new(),
            }),
        }
    }

    /// Accept requests until the feed closes, then drain the in-flight
    /// handlers and release every exclusively held map.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<Incoming>) {
        while let Some(incoming) = rx.recv().await {
            self.dispatch(incoming);
        }
        debug!("request feed closed, draining handlers");
        self.tasks.quiesce().await;
        self.mapper.finalize().await;
    }

    /// Spawn the handler task for one request. Unknown opcodes are logged
    /// and dropped without a reply.
    pub fn dispatch(&self, incoming: Incoming) {
        let op = incoming.req.op;
        if !is_mapper_op(op) {
            error!("unknown operation {:?} for target {}", op, incoming.req.target);
            return;
        }

        self.tasks.enter();
        let mapper = self.mapper.clone();
        let tasks = self.tasks.clone();
        spawn_local(async move {
            let reply = match mapper.handle(&incoming.req).await {
                Ok(data) => match data.encode() {
                    Ok(data) => Reply::served(data),
                    Err(e) => {
                        error!("cannot encode reply for {:?}: {}", op, e);
                        Reply::failed()
                    }
                },
                Err(e) => {
                    warn!(
                        "request {:?} on {} failed: {}",
                        op, incoming.req.target, e
                    );
                    Reply::failed()
                }
            };
            let _ = incoming.done.send(reply);
            tasks.leave();
        });
    }
}
