//! TCP port allocation for concurrently running test processes.
//!
//! A [`PortRange`] owns `[begin, end)` and hands out ports from a cursor
//! that only moves forward. Every candidate is probed before it is returned,
//! but the probe is best-effort: another process may bind the port between
//! the probe and its actual use. No cross-process coordination happens here;
//! processes are kept apart by giving each one its own slice of the port
//! space (see [`PortRange::for_worker`]).

use crate::error::{HarnessError, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};

/// Allocators are plain ranges; sub-ranges are allocators of their own.
pub type PortAllocator = PortRange;

/// Decides whether a port is currently free.
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Probe a port by binding it on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// A range of ports `[begin, end)` with a forward-only allocation cursor.
///
/// Allocation serializes on an internal lock, so a range may be shared
/// between threads (`Arc<PortRange>`).
pub struct PortRange {
    begin: u16,
    end: u16,
    next_free: Mutex<u16>,
    probe: PortProbe,
}

impl PortRange {
    /// Create a range probing ports with [`is_port_free`].
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidPortRange`] if `begin > end` or
    /// `begin == 0`.
    pub fn new(begin: u16, end: u16) -> Result<Self> {
        Self::with_probe(begin, end, Arc::new(is_port_free))
    }

    /// Create a range with a custom liveness probe.
    pub fn with_probe(begin: u16, end: u16, probe: PortProbe) -> Result<Self> {
        if begin == 0 || begin > end {
            return Err(HarnessError::InvalidPortRange { begin, end });
        }
        tracing::debug!(begin, end, "Created port range");
        Ok(Self {
            begin,
            end,
            next_free: Mutex::new(begin),
            probe,
        })
    }

    /// Carve the slice of `[begin, end)` that belongs to one of
    /// `worker_count` concurrently running processes.
    ///
    /// Slices are equal-sized and disjoint; leftover ports at the top of the
    /// range are not used.
    pub fn for_worker(begin: u16, end: u16, worker_index: u16, worker_count: u16) -> Result<Self> {
        if worker_count == 0 || worker_index >= worker_count {
            return Err(HarnessError::Config(format!(
                "worker index {worker_index} out of {worker_count} workers"
            )));
        }
        if begin == 0 || begin > end {
            return Err(HarnessError::InvalidPortRange { begin, end });
        }
        let slice = (end - begin) / worker_count;
        if slice == 0 {
            return Err(HarnessError::InvalidPortRange { begin, end });
        }
        let slice_begin = begin + worker_index * slice;
        tracing::debug!(
            worker_index,
            worker_count,
            slice_begin,
            slice_end = slice_begin + slice,
            "Selected worker port slice"
        );
        Self::new(slice_begin, slice_begin + slice)
    }

    /// First port of the range.
    pub fn begin(&self) -> u16 {
        self.begin
    }

    /// One past the last port of the range.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Next candidate port; `begin <= next_free <= end` always holds.
    pub fn next_free(&self) -> u16 {
        *self.cursor()
    }

    /// Number of ports that have not been examined yet.
    pub fn remaining(&self) -> u16 {
        self.end - self.next_free()
    }

    /// Return the first empirically free port at or after the cursor.
    ///
    /// The cursor moves past every examined candidate, including rejected
    /// ones, so a port that failed the probe is never tried again.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::LackOfPorts`] once the cursor reaches `end`.
    pub fn allocate_port(&self) -> Result<u16> {
        let mut next_free = self.cursor();
        while *next_free < self.end {
            let candidate = *next_free;
            *next_free += 1;
            if (self.probe)(candidate) {
                tracing::debug!(port = candidate, range = %self, "Allocated port");
                return Ok(candidate);
            }
            tracing::trace!(port = candidate, "Port occupied, skipping");
        }
        tracing::warn!(range = %self, "Port range exhausted");
        Err(HarnessError::LackOfPorts {
            begin: self.begin,
            end: self.end,
            next_free: *next_free,
            requested: 1,
        })
    }

    /// Reserve `[next_free, next_free + count)` as a new sub-range.
    ///
    /// The sub-range shares this range's probe and starts probing from its
    /// own beginning. Ports inside it are never handed out by `self`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::LackOfPorts`] if fewer than `count` ports are
    /// left, and leaves the cursor untouched in that case.
    pub fn allocate_port_range(&self, count: u16) -> Result<PortRange> {
        let mut next_free = self.cursor();
        if count == 0 || self.end - *next_free < count {
            return Err(HarnessError::LackOfPorts {
                begin: self.begin,
                end: self.end,
                next_free: *next_free,
                requested: u32::from(count),
            });
        }
        let begin = *next_free;
        *next_free += count;
        tracing::debug!(begin, end = begin + count, parent = %self, "Allocated port sub-range");
        Ok(PortRange {
            begin,
            end: begin + count,
            next_free: Mutex::new(begin),
            probe: Arc::clone(&self.probe),
        })
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, u16> {
        self.next_free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl fmt::Debug for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRange")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("next_free", &self.next_free())
            .finish_non_exhaustive()
    }
}
