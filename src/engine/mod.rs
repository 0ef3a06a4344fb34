//! The forwarding engine.
//!
//! [`Engine`] owns the mapping table and every socket. [`Engine::run`] is a
//! single poll loop that accepts, bridges and relays on non-blocking sockets;
//! the mapping operations can be called from any other thread while it runs.
//! Both sides go through one registry lock, which is only ever held for
//! non-blocking work.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::endpoint::{Endpoint, Mapping};
use crate::mux::{Multiplexer, Ready};

mod registry;
mod tcp;
mod udp;

use self::registry::Registry;

/// Upper bound on how long a shutdown request can go unnoticed.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

const BUFFER_SIZE: usize = 64 * 1024;

const READS_PER_EVENT: usize = 16;
const ACCEPTS_PER_EVENT: usize = 16;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is already forwarded")]
    DuplicateSource(Endpoint),

    #[error("{0} is not forwarded")]
    NotFound(Endpoint),

    #[error("cannot forward {src} to {dest}: protocols differ")]
    ProtocolMismatch { src: Endpoint, dest: Endpoint },

    #[error("cannot resolve {endpoint}: {reason}")]
    Resolve { endpoint: Endpoint, reason: io::Error },

    #[error("cannot bind {endpoint}: {reason}")]
    Bind { endpoint: Endpoint, reason: io::Error },

    #[error("cannot watch {endpoint}: {reason}")]
    Register { endpoint: Endpoint, reason: io::Error },
}

pub struct Engine {
    mux: Multiplexer,
    registry: Mutex<Registry>,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            mux: Multiplexer::new()?,
            registry: Mutex::new(Registry::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Start listening on `src` and forward everything it receives to `dest`.
    ///
    /// Host names are resolved here, before the registry is locked.
    pub fn add_mapping(&self, src: Endpoint, dest: Endpoint) -> Result<(), EngineError> {
        if src.protocol != dest.protocol {
            return Err(EngineError::ProtocolMismatch { src, dest });
        }

        if self.registry.lock().contains(&src) {
            return Err(EngineError::DuplicateSource(src));
        }

        let local = match src.resolve_local() {
            Ok(x) => x,
            Err(reason) => return Err(EngineError::Resolve { endpoint: src, reason }),
        };
        let target = match dest.resolve_remote() {
            Ok(x) => x,
            Err(reason) => return Err(EngineError::Resolve { endpoint: dest, reason }),
        };

        let mapping = Mapping { src, dest };

        self.registry.lock().add(
            &self.mux,
            mapping.src.clone(),
            mapping.dest.clone(),
            local,
            target,
        )?;

        info!("forwarding {}", display!(mapping));
        Ok(())
    }

    /// Stop listening on `src`.
    ///
    /// TCP connections that were already bridged keep running until either
    /// side closes them.
    pub fn del_mapping(&self, src: &Endpoint) -> Result<(), EngineError> {
        let mapping = self.registry.lock().remove(&self.mux, src)?;
        info!("no longer forwarding {}", display!(mapping));
        Ok(())
    }

    pub fn list_mappings(&self) -> Vec<Mapping> {
        self.registry.lock().mappings()
    }

    /// The address the listening socket for `src` is bound to.
    pub fn local_addr(&self, src: &Endpoint) -> Option<SocketAddr> {
        self.registry.lock().local_addr(src)
    }

    /// Number of bridged TCP connections plus open UDP sessions.
    pub fn active_connections(&self) -> usize {
        self.registry.lock().active_connections()
    }

    /// Ask [`Engine::run`] to close everything and return.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        if let Err(e) = self.mux.wake() {
            warn!(
                "cannot wake the poll loop, it will stop within {}: {}",
                display!(POLL_TIMEOUT),
                display!(e)
            );
        }
    }

    /// Run the poll loop until [`Engine::request_shutdown`] is called.
    pub fn run(&self) -> io::Result<()> {
        info!("forwarding engine started");

        let r = self.poll_loop();
        self.registry.lock().drain(&self.mux);

        info!("forwarding engine stopped");
        r
    }

    fn poll_loop(&self) -> io::Result<()> {
        let mut buf = vec![0; BUFFER_SIZE];
        let mut deferred = Vec::new();

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if deferred.is_empty() {
                POLL_TIMEOUT
            } else {
                Duration::ZERO
            };

            let mut ready = self.mux.poll(timeout)?;
            ready.extend(deferred.drain(..).map(Ready::readable));

            for x in ready {
                self.registry
                    .lock()
                    .dispatch(&self.mux, x, &mut buf, &mut deferred);
            }
        }

        Ok(())
    }
}
