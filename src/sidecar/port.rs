//! Local port selection for the analysis process.
//!
//! A candidate is considered free when a listening socket can be bound to it
//! and released again. Ports handed out are remembered until their
//! [`AllocatedPort`] is dropped, so two sessions sharing an allocator never
//! receive the same port even though the probe socket is closed immediately.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::SessionError;

/// How many ephemeral ports to request before giving up on finding one that
/// is not already reserved by a sibling session.
const EPHEMERAL_ATTEMPTS: usize = 16;

type Reservations = Arc<Mutex<HashSet<u16>>>;

/// Reservations of every allocator built with [`PortAllocator::shared`].
static SHARED_RESERVATIONS: LazyLock<Reservations> = LazyLock::new(Reservations::default);

/// Hands out local TCP ports, preferring a configured candidate list.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    reserved: Reservations,
}

impl PortAllocator {
    /// Creates an allocator probing ports on `host`.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            reserved: Arc::default(),
        }
    }

    /// Creates an allocator that shares its reservations with every other
    /// allocator of this process created the same way. Sessions started
    /// without an explicit allocator use this one.
    pub fn shared(host: IpAddr) -> Self {
        Self {
            host,
            reserved: Arc::clone(&SHARED_RESERVATIONS),
        }
    }

    /// Picks the first free port of `preferred`, or any free ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PortExhausted`] when the operating system cannot
    /// supply a port at all.
    pub fn allocate(&self, preferred: &[u16]) -> Result<AllocatedPort, SessionError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);

        for &candidate in preferred {
            if reserved.contains(&candidate) {
                debug!(port = candidate, "preferred port reserved by another session");
                continue;
            }
            match self.probe(candidate) {
                Ok(port) => {
                    reserved.insert(port);
                    debug!(port, "allocated preferred port");
                    return Ok(self.handout(port, preferred, false));
                }
                Err(e) => debug!(port = candidate, error = %e, "preferred port unavailable"),
            }
        }

        let mut last_error = None;
        for _ in 0..EPHEMERAL_ATTEMPTS {
            match self.probe(0) {
                Ok(port) if !reserved.contains(&port) => {
                    reserved.insert(port);
                    warn!(
                        port,
                        ?preferred,
                        "no preferred port free, falling back to ephemeral port"
                    );
                    return Ok(self.handout(port, preferred, true));
                }
                Ok(port) => debug!(port, "ephemeral port already reserved, retrying"),
                Err(e) => last_error = Some(e),
            }
        }

        Err(SessionError::PortExhausted(last_error.map_or_else(
            || "every ephemeral port offered was already reserved".to_string(),
            |e| e.to_string(),
        )))
    }

    /// Returns `true` if `port` is currently handed out by this allocator.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    fn probe(&self, port: u16) -> std::io::Result<u16> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, port))?;
        let bound = listener.local_addr()?.port();
        drop(listener);
        Ok(bound)
    }

    fn handout(&self, port: u16, preferred: &[u16], fallback: bool) -> AllocatedPort {
        AllocatedPort {
            port,
            preferred: preferred.to_vec(),
            fallback,
            reservations: Arc::clone(&self.reserved),
        }
    }
}

/// A port reserved for one session. The reservation ends on drop.
#[derive(Debug)]
pub struct AllocatedPort {
    port: u16,
    preferred: Vec<u16>,
    fallback: bool,
    reservations: Reservations,
}

impl AllocatedPort {
    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The candidate list the port was chosen from.
    pub fn preferred(&self) -> &[u16] {
        &self.preferred
    }

    /// Whether none of the candidates were free and an ephemeral port was used.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

impl Drop for AllocatedPort {
    fn drop(&mut self) {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}
