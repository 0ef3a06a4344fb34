//! The control channel.
//!
//! Mappings are managed at runtime over a Unix socket. Every connection
//! carries exactly one request followed by one reply, both encoded with
//! [`WireCodec`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::codec::Framed;

use crate::engine::Engine;
use crate::wire::{Message, WireCodec, WireError};

mod client;

pub use self::client::{add, del, list, quit, request};

pub const DEFAULT_SOCKET: &str = "/tmp/.proxy-socket";

/// Pause after a failed accept, so a persistent error such as running out of
/// descriptors does not turn the loop into a busy wait.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("connection closed before a message was received")]
    Closed,

    #[error("unexpected reply {0:?}")]
    UnexpectedReply(Message),

    #[error("request was rejected")]
    Rejected,
}

/// Listening side of the control channel.
///
/// The socket file is removed when the server is dropped.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket at `path`, replacing a stale socket file.
    pub fn bind<P>(path: P) -> io::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale socket {}", display!(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Answer requests until a client asks the engine to quit.
    pub async fn serve(self, engine: Arc<Engine>) {
        info!("control socket listening on {}", display!(self.path));

        let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);

        loop {
            tokio::select! {
                r = self.listener.accept() => {
                    let stream = match r {
                        Ok((x, _)) => x,
                        Err(e) => {
                            warn!("failed to accept control connection: {}", display!(e));
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            continue;
                        }
                    };

                    let engine = Arc::clone(&engine);
                    let quit_tx = quit_tx.clone();
                    tokio::spawn(async move {
                        match handle(stream, &engine).await {
                            Ok(true) => {
                                engine.request_shutdown();
                                let _ = quit_tx.send(()).await;
                            }
                            Ok(false) => {}
                            Err(e) => warn!("control connection failed: {e}"),
                        }
                    });
                }

                _ = quit_rx.recv() => break,
            }
        }

        info!("control socket closed");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("cannot remove {}: {}", display!(self.path), display!(e));
        }
    }
}

/// Read one request, apply it and write the reply.
///
/// Returns `true` if the client asked to quit.
async fn handle(stream: UnixStream, engine: &Arc<Engine>) -> Result<bool, ControlError> {
    let mut framed = Framed::new(stream, WireCodec::new());

    let request = framed.next().await.ok_or(ControlError::Closed)??;
    debug!("control request {request:?}");

    let engine = Arc::clone(engine);
    let (reply, quit) = task::spawn_blocking(move || respond(&engine, request))
        .await
        .map_err(io::Error::other)?;

    framed.send(reply).await?;
    Ok(quit)
}

fn respond(engine: &Engine, request: Message) -> (Message, bool) {
    match request {
        Message::AddProxy { src, dest } => match engine.add_mapping(src, dest) {
            Ok(()) => (Message::Ack(true), false),
            Err(e) => {
                warn!("add rejected: {e}");
                (Message::Ack(false), false)
            }
        },

        Message::DelProxy { src } => match engine.del_mapping(&src) {
            Ok(()) => (Message::Ack(true), false),
            Err(e) => {
                warn!("delete rejected: {e}");
                (Message::Ack(false), false)
            }
        },

        Message::GetProxies(x) if !x.is_empty() => {
            warn!("ignoring listing request that carries {} mappings", x.len());
            (Message::Ack(false), false)
        }

        Message::GetProxies(_) => (Message::GetProxies(engine.list_mappings()), false),

        Message::Quit => {
            info!("quit requested over the control socket");
            (Message::Ack(true), true)
        }

        Message::Ack(_) => {
            warn!("ignoring acknowledgement sent as a request");
            (Message::Ack(false), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, Mapping};

    #[test]
    fn respond_to_requests() {
        let engine = Engine::new().unwrap();
        let src = Endpoint::tcp("127.0.0.1", 0);
        let dest = Endpoint::tcp("127.0.0.1", 80);

        let add = Message::AddProxy {
            src: src.clone(),
            dest: dest.clone(),
        };
        assert_eq!(respond(&engine, add.clone()), (Message::Ack(true), false));
        assert_eq!(respond(&engine, add), (Message::Ack(false), false));

        assert_eq!(
            respond(&engine, Message::GetProxies(Vec::new())),
            (
                Message::GetProxies(vec![Mapping {
                    src: src.clone(),
                    dest
                }]),
                false
            )
        );

        let del = Message::DelProxy { src };
        assert_eq!(respond(&engine, del.clone()), (Message::Ack(true), false));
        assert_eq!(respond(&engine, del), (Message::Ack(false), false));

        assert_eq!(respond(&engine, Message::Ack(true)), (Message::Ack(false), false));
        assert_eq!(
            respond(
                &engine,
                Message::GetProxies(vec![Mapping {
                    src: Endpoint::tcp("", 1),
                    dest: Endpoint::tcp("", 2),
                }])
            ),
            (Message::Ack(false), false)
        );
        assert_eq!(respond(&engine, Message::Quit), (Message::Ack(true), true));
    }
}
