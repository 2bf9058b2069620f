//! Relay port allocator
//!
//! Hands out UDP ports from a fixed inclusive range. Allocation is
//! deterministic: the next free port after the last one handed out,
//! wrapping after the end of the range. Exhaustion returns immediately.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Port allocator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("invalid relay port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("relay port range {start}-{end} exhausted")]
    Exhausted { start: u16, end: u16 },
}

struct AllocState {
    /// One flag per port in the range
    allocated: Vec<bool>,
    /// Offset to start the next search from
    cursor: usize,
    in_use: usize,
}

/// Thread-safe allocator over `[start, end]`
pub struct PortAllocator {
    start: u16,
    end: u16,
    state: Mutex<AllocState>,
}

impl PortAllocator {
    /// Configure the usable range
    pub fn initialize(start: u16, end: u16) -> Result<Self, PortError> {
        if start == 0 || start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        let len = (end - start) as usize + 1;
        debug!("Port allocator range {}-{} ({} ports)", start, end, len);
        Ok(Self {
            start,
            end,
            state: Mutex::new(AllocState {
                allocated: vec![false; len],
                cursor: 0,
                in_use: 0,
            }),
        })
    }

    /// Allocate the next free port
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut state = self.state.lock();
        let len = state.allocated.len();
        if state.in_use == len {
            return Err(PortError::Exhausted {
                start: self.start,
                end: self.end,
            });
        }

        for step in 0..len {
            let idx = (state.cursor + step) % len;
            if !state.allocated[idx] {
                state.allocated[idx] = true;
                state.in_use += 1;
                state.cursor = (idx + 1) % len;
                return Ok(self.start + idx as u16);
            }
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool
    ///
    /// Releasing a port that is free or outside the range is a caller bug.
    /// It panics in debug builds and is ignored in release builds.
    pub fn release(&self, port: u16) {
        if !self.try_release(port) {
            warn!("Release of port {} which is not allocated", port);
            debug_assert!(false, "port {} released but not allocated", port);
        }
    }

    fn try_release(&self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        let idx = (port - self.start) as usize;
        let mut state = self.state.lock();
        if !state.allocated[idx] {
            return false;
        }
        state.allocated[idx] = false;
        state.in_use -= 1;
        true
    }

    /// Allocate a port wrapped in a guard that releases it on drop
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let port = self.allocate()?;
        Ok(PortLease {
            port,
            allocator: self.clone(),
        })
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        self.state.lock().allocated[(port - self.start) as usize]
    }

    /// Number of ports currently handed out
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Total number of ports in the range
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

/// An allocated port, released exactly once when dropped
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        debug!("Releasing relay port {}", self.port);
        self.allocator.release(self.port);
    }
}
