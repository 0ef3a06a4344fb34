//! UDP forwarding.
//!
//! UDP has no connections, so a mapping keeps at most one session: the first
//! client that sends a datagram gets a bridge socket, bound to an ephemeral
//! port and connected to the destination. Replies read from the bridge are
//! sent back to that client through the listening socket.
//!
//! An empty datagram from the client ends the session and closes the bridge.
//! This is a convention, a legitimate empty payload cannot be told apart from
//! it. The listening socket stays open for the next client.
//!
//! Sessions have no idle timeout. A client that goes away without sending the
//! empty datagram keeps its session until the bridge fails or the mapping is
//! deleted, and datagrams from every other client are dropped meanwhile.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::Token;
use mio::net::UdpSocket;

use super::READS_PER_EVENT;
use super::registry::{Listener, Pair, Registry, Server, UdpServer, Work, alloc};
use crate::mux::Multiplexer;

pub(super) struct Session {
    pub bridge: UdpSocket,
    pub token: Token,
    pub client: SocketAddr,
}

fn open_session(
    mux: &Multiplexer,
    next_token: &mut usize,
    server: Token,
    target: SocketAddr,
    client: SocketAddr,
) -> io::Result<Session> {
    let unspecified = match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let mut bridge = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    bridge.connect(target)?;

    let token = alloc(next_token);
    mux.register(&mut bridge, token)?;

    if let Ok(local) = bridge.local_addr() {
        info!(
            "session for {} bridged through {} ({})",
            display!(client),
            display!(local),
            display!(token)
        );
    }
    trace!("session {} belongs to {}", display!(token), display!(server));

    Ok(Session {
        bridge,
        token,
        client,
    })
}

/// Close the session of `udp`, if there is one.
pub(super) fn close_session(
    mux: &Multiplexer,
    pairs: &mut HashMap<Token, Pair>,
    udp: &mut UdpServer,
) -> bool {
    let Some(mut session) = udp.session.take() else {
        return false;
    };

    pairs.remove(&session.token);
    if let Err(e) = mux.unregister(&mut session.bridge) {
        debug!(
            "failed to unregister {}: {}",
            display!(session.token),
            display!(e)
        );
    }

    info!("session for {} closed", display!(session.client));
    true
}

impl Registry {
    /// Handle datagrams arriving on the listening socket of a UDP mapping.
    pub(super) fn receive(&mut self, mux: &Multiplexer, token: Token, buf: &mut [u8]) -> Work {
        let Some(Server {
            src,
            target,
            socket: Listener::Udp(udp),
            ..
        }) = self.servers.get_mut(&token)
        else {
            return Work::Done;
        };

        for _ in 0..READS_PER_EVENT {
            let (n, client) = match udp.socket.recv_from(buf) {
                Ok(x) => x,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Work::Done,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("receive on {} failed: {}", display!(*src), display!(e));
                    return Work::Done;
                }
            };

            if n == 0 {
                if udp.session.as_ref().is_some_and(|x| x.client == client) {
                    close_session(mux, &mut self.pairs, udp);
                } else {
                    debug!("ignoring empty datagram from {}", display!(client));
                }
                continue;
            }

            if udp.session.is_none() {
                match open_session(mux, &mut self.next_token, token, *target, client) {
                    Ok(session) => {
                        self.pairs.insert(session.token, Pair::Bridge { server: token });
                        udp.session = Some(session);
                    }
                    Err(e) => {
                        warn!(
                            "cannot open a session for {}: {}",
                            display!(client),
                            display!(e)
                        );
                        continue;
                    }
                }
            }

            let Some(session) = &udp.session else {
                continue;
            };

            if session.client != client {
                debug!(
                    "dropping datagram from {}, session belongs to {}",
                    display!(client),
                    display!(session.client)
                );
                continue;
            }

            if let Err(e) = session.bridge.send(&buf[..n]) {
                warn!(
                    "forwarding datagram from {} failed: {}",
                    display!(client),
                    display!(e)
                );
            }
        }

        Work::More
    }

    /// Handle datagrams arriving on a bridge socket from the destination.
    pub(super) fn reply(
        &mut self,
        mux: &Multiplexer,
        token: Token,
        server: Token,
        buf: &mut [u8],
    ) -> Work {
        let Some(Server {
            socket: Listener::Udp(udp),
            ..
        }) = self.servers.get_mut(&server)
        else {
            return Work::Done;
        };

        for _ in 0..READS_PER_EVENT {
            let Some(session) = udp.session.as_ref().filter(|x| x.token == token) else {
                return Work::Done;
            };
            let client = session.client;

            let n = match session.bridge.recv(buf) {
                Ok(0) => {
                    debug!("{} received an empty datagram", display!(token));
                    close_session(mux, &mut self.pairs, udp);
                    return Work::Done;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Work::Done,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("receive on {} failed: {}", display!(token), display!(e));
                    close_session(mux, &mut self.pairs, udp);
                    return Work::Done;
                }
            };

            if let Err(e) = udp.socket.send_to(&buf[..n], client) {
                warn!("reply to {} failed: {}", display!(client), display!(e));
            }
        }

        Work::More
    }
}
