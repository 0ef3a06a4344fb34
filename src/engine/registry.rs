use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use mio::Token;
use mio::net::{TcpListener, TcpStream, UdpSocket};

use super::EngineError;
use super::udp::{self, Session};
use crate::endpoint::{Endpoint, Mapping, Protocol};
use crate::mux::{Multiplexer, Ready};

/// Whether a handler stopped because it ran out of its per-event budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Work {
    Done,
    More,
}

pub(super) enum Listener {
    Tcp(TcpListener),
    Udp(UdpServer),
}

impl Listener {
    fn bind(protocol: Protocol, addr: SocketAddr) -> io::Result<Self> {
        match protocol {
            Protocol::Tcp => TcpListener::bind(addr).map(Self::Tcp),
            Protocol::Udp => UdpSocket::bind(addr).map(|socket| {
                Self::Udp(UdpServer {
                    socket,
                    session: None,
                })
            }),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(x) => x.local_addr(),
            Self::Udp(x) => x.socket.local_addr(),
        }
    }
}

pub(super) struct UdpServer {
    pub socket: UdpSocket,
    pub session: Option<Session>,
}

/// A listening socket bound to the source of a mapping.
pub(super) struct Server {
    pub src: Endpoint,
    pub dest: Endpoint,
    pub target: SocketAddr,
    pub socket: Listener,
}

/// One direction of a bridged TCP connection.
///
/// Bytes read from `stream` go to the half registered under `peer`. The
/// backlog holds bytes destined to `stream` that could not be written yet.
pub(super) struct Half {
    pub stream: TcpStream,
    pub peer: Token,
    pub backlog: Vec<u8>,
}

impl Half {
    pub fn new(stream: TcpStream, peer: Token) -> Self {
        Self {
            stream,
            peer,
            backlog: Vec::new(),
        }
    }
}

pub(super) enum Pair {
    Stream(Half),
    /// A UDP bridge socket, owned by the session of `server`.
    Bridge { server: Token },
}

/// Every socket the engine owns, indexed by source endpoint and by token.
///
/// A token is either in `servers` or in `pairs`, never in both, and tokens
/// are never reused.
#[derive(Default)]
pub(super) struct Registry {
    pub next_token: usize,
    pub sources: HashMap<Endpoint, Token>,
    pub servers: HashMap<Token, Server>,
    pub pairs: HashMap<Token, Pair>,
}

/// Hand out the next unused token. Token 0 belongs to the waker.
pub(super) fn alloc(next_token: &mut usize) -> Token {
    *next_token += 1;
    Token(*next_token)
}

impl Registry {
    pub fn contains(&self, src: &Endpoint) -> bool {
        self.sources.contains_key(src)
    }

    pub fn add(
        &mut self,
        mux: &Multiplexer,
        src: Endpoint,
        dest: Endpoint,
        local: SocketAddr,
        target: SocketAddr,
    ) -> Result<(), EngineError> {
        if self.contains(&src) {
            return Err(EngineError::DuplicateSource(src));
        }

        let mut socket = match Listener::bind(src.protocol, local) {
            Ok(x) => x,
            Err(reason) => return Err(EngineError::Bind { endpoint: src, reason }),
        };

        let token = alloc(&mut self.next_token);
        let registered = match &mut socket {
            Listener::Tcp(x) => mux.register(x, token),
            Listener::Udp(x) => mux.register(&mut x.socket, token),
        };
        if let Err(reason) = registered {
            return Err(EngineError::Register { endpoint: src, reason });
        }

        debug!("listening on {} as {}", display!(src), display!(token));
        self.sources.insert(src.clone(), token);
        self.servers.insert(
            token,
            Server {
                src,
                dest,
                target,
                socket,
            },
        );

        Ok(())
    }

    /// Stop listening on `src`. Connections already bridged through it are
    /// left alone, except for a UDP session whose client side is the
    /// listening socket itself.
    pub fn remove(&mut self, mux: &Multiplexer, src: &Endpoint) -> Result<Mapping, EngineError> {
        let server = self
            .sources
            .remove(src)
            .and_then(|token| self.servers.remove(&token))
            .ok_or_else(|| EngineError::NotFound(src.clone()))?;

        let Server {
            src,
            dest,
            mut socket,
            ..
        } = server;

        let unregistered = match &mut socket {
            Listener::Tcp(x) => mux.unregister(x),
            Listener::Udp(x) => {
                udp::close_session(mux, &mut self.pairs, x);
                mux.unregister(&mut x.socket)
            }
        };
        if let Err(e) = unregistered {
            debug!("failed to unregister {}: {}", display!(src), display!(e));
        }

        Ok(Mapping { src, dest })
    }

    pub fn mappings(&self) -> Vec<Mapping> {
        let mut servers: Vec<_> = self.servers.iter().collect();
        servers.sort_by_key(|(token, _)| **token);

        servers
            .into_iter()
            .map(|(_, x)| Mapping {
                src: x.src.clone(),
                dest: x.dest.clone(),
            })
            .collect()
    }

    pub fn local_addr(&self, src: &Endpoint) -> Option<SocketAddr> {
        let token = self.sources.get(src)?;
        self.servers.get(token)?.socket.local_addr().ok()
    }

    pub fn active_connections(&self) -> usize {
        let (streams, bridges) =
            self.pairs
                .values()
                .fold((0, 0), |(streams, bridges), pair| match pair {
                    Pair::Stream(_) => (streams + 1, bridges),
                    Pair::Bridge { .. } => (streams, bridges + 1),
                });

        streams / 2 + bridges
    }

    /// Handle one readiness notification.
    ///
    /// Tokens that still have pending work after their budget is spent are
    /// pushed to `deferred`.
    pub fn dispatch(
        &mut self,
        mux: &Multiplexer,
        ready: Ready,
        buf: &mut [u8],
        deferred: &mut Vec<Token>,
    ) {
        let token = ready.token;

        if let Some(protocol) = self.servers.get(&token).map(|x| x.src.protocol) {
            let work = match protocol {
                Protocol::Tcp => self.accept(mux, token),
                Protocol::Udp => self.receive(mux, token, buf),
            };

            if work == Work::More {
                deferred.push(token);
            }
            return;
        }

        match self.pairs.get(&token) {
            Some(Pair::Stream(half)) => {
                let peer = half.peer;

                // The peer was held back while this stream had a backlog.
                if ready.writable
                    && self.flush(mux, token)
                    && self.relay(mux, peer, buf) == Work::More
                {
                    deferred.push(peer);
                }

                if self.relay(mux, token, buf) == Work::More {
                    deferred.push(token);
                }
            }

            Some(&Pair::Bridge { server }) => {
                if self.reply(mux, token, server, buf) == Work::More {
                    deferred.push(token);
                }
            }

            None => trace!("ignoring event for stale token {}", display!(token)),
        }
    }

    /// Close both directions of the connection `token` belongs to.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn teardown(&mut self, mux: &Multiplexer, token: Token) -> bool {
        match self.pairs.remove(&token) {
            None => false,

            Some(Pair::Stream(mut half)) => {
                let peer = half.peer;

                if let Err(e) = mux.unregister(&mut half.stream) {
                    debug!("failed to unregister {}: {}", display!(token), display!(e));
                }

                if let Some(Pair::Stream(mut other)) = self.pairs.remove(&peer) {
                    if let Err(e) = mux.unregister(&mut other.stream) {
                        debug!("failed to unregister {}: {}", display!(peer), display!(e));
                    }
                }

                info!(
                    "connection {}/{} closed",
                    display!(token),
                    display!(peer)
                );
                true
            }

            Some(Pair::Bridge { server }) => {
                let Some(Server {
                    socket: Listener::Udp(udp),
                    ..
                }) = self.servers.get_mut(&server)
                else {
                    return true;
                };

                if udp.session.as_ref().is_some_and(|x| x.token == token) {
                    udp::close_session(mux, &mut self.pairs, udp);
                }
                true
            }
        }
    }

    /// Close every socket. Used when the engine shuts down.
    pub fn drain(&mut self, mux: &Multiplexer) {
        self.sources.clear();

        for (_, server) in self.servers.drain() {
            let Server { src, mut socket, .. } = server;

            let unregistered = match &mut socket {
                Listener::Tcp(x) => mux.unregister(x),
                Listener::Udp(x) => {
                    if let Some(mut session) = x.session.take() {
                        let _ = mux.unregister(&mut session.bridge);
                    }
                    mux.unregister(&mut x.socket)
                }
            };
            if let Err(e) = unregistered {
                debug!("failed to unregister {}: {}", display!(src), display!(e));
            }

            debug!("stopped listening on {}", display!(src));
        }

        for (_, pair) in self.pairs.drain() {
            if let Pair::Stream(mut half) = pair {
                let _ = mux.unregister(&mut half.stream);
            }
        }
    }
}
