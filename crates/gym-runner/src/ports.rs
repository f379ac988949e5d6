use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::ops::Range;
use std::time::Duration;
use tracing::debug;

use crate::config::GymConfig;
use crate::error::AttemptError;

/// Picks host ports for target containers by probing random candidates.
/// Random sampling keeps concurrently starting runs from piling onto the
/// same narrow band of ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
    probe_timeout: Duration,
}

impl PortAllocator {
    pub fn new(range: Range<u16>, max_attempts: u32, probe_timeout: Duration) -> Self {
        Self {
            range,
            max_attempts,
            probe_timeout,
        }
    }

    pub fn from_config(config: &GymConfig) -> Self {
        Self::new(
            config.port_range(),
            config.port_probe_attempts,
            config.port_probe_timeout(),
        )
    }

    pub fn allocate(&self) -> Result<u16, AttemptError> {
        let exhausted = AttemptError::PortAllocationExhausted {
            start: self.range.start,
            end: self.range.end,
            attempts: self.max_attempts,
        };
        if self.range.is_empty() {
            return Err(exhausted);
        }
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(self.range.clone());
            if is_port_free(candidate, self.probe_timeout) {
                return Ok(candidate);
            }
            debug!(port = candidate, "port in use, probing another");
        }
        Err(exhausted)
    }
}

/// A port counts as free when nothing accepts a connection on it. The
/// answer can go stale as soon as it is returned.
pub fn is_port_free(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, timeout).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const PROBE: Duration = Duration::from_millis(200);

    #[test]
    fn bound_port_is_not_free() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(!is_port_free(port, PROBE));
    }

    #[test]
    fn never_returns_a_listening_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let allocator = PortAllocator::new(port..port.saturating_add(1), 25, PROBE);
        match allocator.allocate() {
            Err(AttemptError::PortAllocationExhausted { attempts, .. }) => {
                assert_eq!(attempts, 25)
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn allocates_within_range() {
        let allocator = PortAllocator::new(40_000..50_000, 1000, PROBE);
        let port = allocator.allocate().expect("free port");
        assert!((40_000..50_000).contains(&port));
    }

    #[test]
    fn empty_range_is_exhausted_immediately() {
        let allocator = PortAllocator::new(5000..5000, 1000, PROBE);
        assert!(matches!(
            allocator.allocate(),
            Err(AttemptError::PortAllocationExhausted { .. })
        ));
    }
}
