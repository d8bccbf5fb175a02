//! Line-delimited JSON control service.
//!
//! Each connection sends one request per line and gets one JSON reply per
//! line, except `subscribe`, which turns the connection into a one-way
//! event stream until the client hangs up. Authentication and routing live
//! in front of this service; requests arrive already carrying a user id.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::dispatch::{Dispatcher, TransferRequest};
use crate::job::{Job, JobStore};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Transfer {
        user_id: i64,
        #[serde(flatten)]
        request: TransferRequest,
    },
    Jobs {
        user_id: i64,
    },
    Subscribe {
        user_id: i64,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    Job { ok: bool, job: Job },
    Jobs { ok: bool, jobs: Vec<Job> },
    Error { ok: bool, error: String },
}

impl Reply {
    fn job(job: Job) -> Self {
        Reply::Job { ok: true, job }
    }

    fn jobs(jobs: Vec<Job>) -> Self {
        Reply::Jobs { ok: true, jobs }
    }

    fn error(err: impl ToString) -> Self {
        Reply::Error {
            ok: false,
            error: err.to_string(),
        }
    }
}

/// Shared handles every connection task needs.
pub struct ServerContext {
    pub dispatcher: Dispatcher,
    pub store: Arc<JobStore>,
    pub broadcaster: Arc<Broadcaster>,
}

pub async fn serve(
    bind: &str,
    ctx: Arc<ServerContext>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "control service listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                debug!(%peer, "connection accepted");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("control service shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_reply(&mut writer, &Reply::error(format!("bad request: {e}"))).await?;
                continue;
            }
        };

        match request {
            Request::Transfer { user_id, request } => {
                let reply = match ctx.dispatcher.submit(request, user_id) {
                    Ok(job) => Reply::job(job),
                    Err(e) => {
                        warn!(user = user_id, error = %e, "transfer request rejected");
                        Reply::error(e)
                    }
                };
                write_reply(&mut writer, &reply).await?;
            }
            Request::Jobs { user_id } => {
                write_reply(&mut writer, &Reply::jobs(ctx.store.list_for_user(user_id))).await?;
            }
            Request::Subscribe { user_id } => {
                // the connection becomes an event stream; no further
                // requests are read from it
                let (conn_id, mut events) = ctx.broadcaster.register(user_id);
                debug!(user = user_id, conn = %conn_id, "subscribed");
                let result = async {
                    while let Some(event) = events.recv().await {
                        let mut payload = serde_json::to_vec(&event)?;
                        payload.push(b'\n');
                        writer.write_all(&payload).await?;
                    }
                    Ok::<_, anyhow::Error>(())
                }
                .await;
                ctx.broadcaster.unregister(user_id, conn_id);
                debug!(user = user_id, conn = %conn_id, "unsubscribed");
                return result;
            }
        }
    }
    Ok(())
}

async fn write_reply<W: AsyncWriteExt + Unpin>(writer: &mut W, reply: &Reply) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_from_wire_shape() {
        let r: Request = serde_json::from_str(
            r#"{"op":"transfer","user_id":7,"source":"/a","dest":"/b","description":"nightly"}"#,
        )
        .unwrap();
        match r {
            Request::Transfer { user_id, request } => {
                assert_eq!(user_id, 7);
                assert_eq!(request.source, "/a");
                assert_eq!(request.dest, "/b");
                assert_eq!(request.description.as_deref(), Some("nightly"));
            }
            other => panic!("unexpected request {other:?}"),
        }

        let r: Request = serde_json::from_str(r#"{"op":"jobs","user_id":7}"#).unwrap();
        assert!(matches!(r, Request::Jobs { user_id: 7 }));

        let r: Request = serde_json::from_str(r#"{"op":"subscribe","user_id":9}"#).unwrap();
        assert!(matches!(r, Request::Subscribe { user_id: 9 }));
    }

    #[test]
    fn error_reply_carries_ok_false() {
        let v = serde_json::to_value(Reply::error("nope")).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "nope");
    }
}
