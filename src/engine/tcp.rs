use std::io::{self, Read, Write};

use mio::Token;
use mio::net::TcpStream;

use super::registry::{Half, Listener, Pair, Registry, Server, Work, alloc};
use super::{ACCEPTS_PER_EVENT, READS_PER_EVENT};
use crate::mux::Multiplexer;

impl Registry {
    /// Accept pending connections on a TCP listener and bridge each of them
    /// to the destination of the mapping.
    pub(super) fn accept(&mut self, mux: &Multiplexer, token: Token) -> Work {
        let Some(Server {
            src,
            dest,
            target,
            socket: Listener::Tcp(listener),
        }) = self.servers.get(&token)
        else {
            return Work::Done;
        };

        for _ in 0..ACCEPTS_PER_EVENT {
            let (mut inbound, addr) = match listener.accept() {
                Ok(x) => x,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Work::Done,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        "failed to accept connection on {}: {}",
                        display!(src),
                        display!(e)
                    );
                    return Work::Done;
                }
            };

            // Dropping `inbound` on failure closes it before anything is
            // registered.
            let mut outbound = match TcpStream::connect(*target) {
                Ok(x) => x,
                Err(e) => {
                    error!(
                        "cannot connect {} to {}: {}",
                        display!(addr),
                        display!(dest),
                        display!(e)
                    );
                    continue;
                }
            };

            let a = alloc(&mut self.next_token);
            let b = alloc(&mut self.next_token);

            if let Err(e) = mux.register(&mut inbound, a) {
                warn!("cannot watch connection from {}: {}", display!(addr), display!(e));
                continue;
            }

            if let Err(e) = mux.register(&mut outbound, b) {
                warn!("cannot watch connection to {}: {}", display!(dest), display!(e));
                let _ = mux.unregister(&mut inbound);
                continue;
            }

            self.pairs.insert(a, Pair::Stream(Half::new(inbound, b)));
            self.pairs.insert(b, Pair::Stream(Half::new(outbound, a)));

            info!(
                "connection from {} bridged to {} ({}/{})",
                display!(addr),
                display!(dest),
                display!(a),
                display!(b)
            );
        }

        Work::More
    }

    /// Move bytes from the stream registered under `token` to its peer.
    ///
    /// A zero-length read or a read error closes both directions.
    pub(super) fn relay(&mut self, mux: &Multiplexer, token: Token, buf: &mut [u8]) -> Work {
        for _ in 0..READS_PER_EVENT {
            let Some(Pair::Stream(half)) = self.pairs.get(&token) else {
                return Work::Done;
            };
            let peer = half.peer;

            match self.pairs.get(&peer) {
                Some(Pair::Stream(other)) if !other.backlog.is_empty() => {
                    trace!("{} is backlogged, holding {}", display!(peer), display!(token));
                    return Work::Done;
                }
                Some(_) => {}
                None => return Work::Done,
            }

            let n = match (&half.stream).read(buf) {
                Ok(0) => {
                    debug!("{} reached end of stream", display!(token));
                    self.teardown(mux, token);
                    return Work::Done;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Work::Done,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read from {} failed: {}", display!(token), display!(e));
                    self.teardown(mux, token);
                    return Work::Done;
                }
            };

            self.forward(mux, peer, &buf[..n]);
        }

        Work::More
    }

    /// Write `data` to the stream registered under `token`.
    ///
    /// Whatever the socket does not take right away is kept in its backlog
    /// until it becomes writable. Write errors are only logged, the read side
    /// notices the broken connection on its next readiness event.
    fn forward(&mut self, mux: &Multiplexer, token: Token, mut data: &[u8]) {
        let Some(Pair::Stream(half)) = self.pairs.get_mut(&token) else {
            return;
        };

        while !data.is_empty() {
            match (&half.stream).write(data) {
                Ok(0) => {
                    warn!("{} does not accept any more bytes", display!(token));
                    return;
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("{} backlogged {} bytes", display!(token), data.len());
                    half.backlog.extend_from_slice(data);

                    if let Err(e) = mux.watch_writable(&mut half.stream, token) {
                        warn!("cannot watch {} for writing: {}", display!(token), display!(e));
                    }
                    return;
                }
                Err(e) => {
                    warn!("write to {} failed: {}", display!(token), display!(e));
                    return;
                }
            }
        }
    }

    /// Write out the backlog of the stream registered under `token`.
    ///
    /// Returns `true` once the backlog is empty.
    pub(super) fn flush(&mut self, mux: &Multiplexer, token: Token) -> bool {
        let Some(Pair::Stream(half)) = self.pairs.get_mut(&token) else {
            return false;
        };

        while !half.backlog.is_empty() {
            match (&half.stream).write(&half.backlog) {
                Ok(0) => {
                    warn!("{} does not accept any more bytes", display!(token));
                    half.backlog.clear();
                }
                Ok(n) => {
                    half.backlog.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    warn!("write to {} failed: {}", display!(token), display!(e));
                    half.backlog.clear();
                }
            }
        }

        if let Err(e) = mux.unwatch_writable(&mut half.stream, token) {
            warn!("cannot stop watching {} for writing: {}", display!(token), display!(e));
        }
        true
    }
}
