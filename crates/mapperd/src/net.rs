//! Framed-TCP stand-in for the request ring: length-delimited frames of a
//! little-endian request id followed by the serialized request or reply.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use mapperd_core::blocker::{Port, Submission};
use mapperd_core::dispatcher::Incoming;
use mapperd_core::xseg::{Reply, Request};
use mapperd_serialization::{Read, Write};
use spdlog::{error, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::spawn_local;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

fn frame(id: u64, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

fn split_frame(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let id = u64::from_le_bytes(data[..8].try_into().unwrap());
    Some((id, &data[8..]))
}

/// Connect one blocker port and return the submit handle driving it.
pub async fn connect_blocker(port: u16) -> anyhow::Result<Port> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_local(drive_blocker(stream, rx));
    Ok(Port::new(tx))
}

/// Pump submissions out to a blocker and route its replies back by request
/// id. When the connection dies, pending submissions fail by dropping
/// their reply channels.
async fn drive_blocker(stream: TcpStream, mut rx: mpsc::UnboundedReceiver<Submission>) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut pending: HashMap<u64, oneshot::Sender<Reply>> = HashMap::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            sub = rx.recv() => {
                let Some(Submission { req, done }) = sub else { break };
                let body = match req.pack() {
                    Ok(body) => body,
                    Err(e) => {
                        error!("cannot serialize request for {}: {}", req.target, e);
                        continue;
                    }
                };
                next_id += 1;
                pending.insert(next_id, done);
                if framed.send(frame(next_id, &body)).await.is_err() {
                    error!("blocker connection lost");
                    break;
                }
            }
            reply = framed.next() => {
                let Some(Ok(data)) = reply else {
                    error!("blocker connection lost");
                    break;
                };
                let Some((id, body)) = split_frame(&data) else {
                    warn!("short frame from blocker");
                    continue;
                };
                match Reply::unpack(body) {
                    Ok(reply) => match pending.remove(&id) {
                        Some(done) => {
                            let _ = done.send(reply);
                        }
                        None => warn!("reply for unknown request {}", id),
                    },
                    Err(e) => warn!("cannot parse reply {}: {}", id, e),
                }
            }
        }
    }
}

/// Serve one client connection: decode requests into the dispatcher feed
/// and write completions back as they arrive.
pub fn serve_conn(stream: TcpStream, feed: mpsc::UnboundedSender<Incoming>, cancel: CancellationToken) {
    spawn_local(async move {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(u64, Reply)>();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                out = out_rx.recv() => {
                    let Some((id, reply)) = out else { break };
                    let body = match reply.pack() {
                        Ok(body) => body,
                        Err(e) => {
                            error!("cannot serialize reply {}: {}", id, e);
                            continue;
                        }
                    };
                    if framed.send(frame(id, &body)).await.is_err() {
                        break;
                    }
                }
                incoming = framed.next() => {
                    let Some(Ok(data)) = incoming else { break };
                    let Some((id, body)) = split_frame(&data) else {
                        warn!("short frame from client");
                        continue;
                    };
                    let req = match Request::unpack(body) {
                        Ok(req) => req,
                        Err(e) => {
                            warn!("cannot parse request {}: {}", id, e);
                            continue;
                        }
                    };
                    let (done, reply_rx) = oneshot::channel();
                    if feed.send(Incoming { req, done }).is_err() {
                        break;
                    }
                    let out_tx = out_tx.clone();
                    spawn_local(async move {
                        // An ignored request never answers; the client sees
                        // no completion for its id.
                        if let Ok(reply) = reply_rx.await {
                            let _ = out_tx.send((id, reply));
                        }
                    });
                }
            }
        }
    });
}
