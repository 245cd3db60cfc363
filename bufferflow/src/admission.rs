//! Admission control and port assignment.
//!
//! [`AdmissionController`] bounds the number of jobs executing at once. A
//! successful [`AdmissionController::try_admit`] returns an [`AdmissionPermit`]
//! that gives the slot back when dropped, so the counter is decremented on
//! every exit path of a job: success, failure, timeout, or panic unwinding.
//!
//! [`PortAllocator`] hands each admitted job a TCP port for its worker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
struct Slots {
    executing: AtomicUsize,
    limit: usize,
}

/// Bounded counter of concurrently executing jobs.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    slots: Arc<Slots>,
}

impl AdmissionController {
    /// Creates a controller allowing `limit` concurrent jobs (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Slots {
                executing: AtomicUsize::new(0),
                limit: limit.max(1),
            }),
        }
    }

    /// Takes a slot if one is free.
    ///
    /// The check and the increment are one atomic step, so concurrent callers
    /// can never push the count past the limit.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let limit = self.slots.limit;
        self.slots
            .executing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|prev| {
                debug!(executing = prev + 1, limit, "Admission slot taken");
                AdmissionPermit {
                    slots: Arc::clone(&self.slots),
                }
            })
    }

    /// Number of jobs currently holding a slot.
    pub fn executing(&self) -> usize {
        self.slots.executing.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.slots.limit
    }

    pub fn has_capacity(&self) -> bool {
        self.executing() < self.slots.limit
    }
}

/// A held admission slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    slots: Arc<Slots>,
}

impl AdmissionPermit {
    /// Releases the slot now. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let result = self
            .slots
            .executing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(prev) => debug!(executing = prev - 1, "Admission slot released"),
            Err(_) => warn!("Admission counter already zero on release"),
        }
    }
}

#[derive(Debug)]
struct PortState {
    next: u16,
    in_use: HashSet<u16>,
}

/// Assigns worker TCP ports.
///
/// Ports increase monotonically from the configured start port. After
/// `u16::MAX` the sequence wraps to the start port, and a port still held by
/// an active job is skipped.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    start: u16,
    state: Arc<Mutex<PortState>>,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        let start = start.max(1);
        Self {
            start,
            state: Arc::new(Mutex::new(PortState {
                next: start,
                in_use: HashSet::new(),
            })),
        }
    }

    /// Returns the next free port, or `None` if every port in range is held.
    pub fn allocate(&self) -> Option<u16> {
        let mut state = self.state.lock();
        let range = usize::from(u16::MAX - self.start) + 1;
        for _ in 0..range {
            let candidate = state.next;
            state.next = if candidate == u16::MAX {
                self.start
            } else {
                candidate + 1
            };
            if state.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Returns a port to the pool.
    pub fn release(&self, port: u16) {
        self.state.lock().in_use.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Allocates a port held by a guard that releases it when dropped.
    pub fn lease(&self) -> Option<PortLease> {
        self.allocate().map(|port| PortLease {
            port,
            allocator: self.clone(),
        })
    }
}

/// A port held for the lifetime of one job.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: PortAllocator,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
        debug!(port = self.port, "Port released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_respects_limit() {
        let admission = AdmissionController::new(2);

        let p1 = admission.try_admit();
        let p2 = admission.try_admit();
        let p3 = admission.try_admit();

        assert!(p1.is_some());
        assert!(p2.is_some());
        assert!(p3.is_none());
        assert_eq!(admission.executing(), 2);
        assert!(!admission.has_capacity());
    }

    #[test]
    fn test_drop_releases_slot() {
        let admission = AdmissionController::new(1);
        let permit = admission.try_admit().unwrap();
        assert!(admission.try_admit().is_none());

        drop(permit);
        assert_eq!(admission.executing(), 0);
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn test_zero_limit_treated_as_one() {
        let admission = AdmissionController::new(0);
        assert_eq!(admission.limit(), 1);
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let admission = AdmissionController::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(permit) = admission.try_admit() {
                            peak.fetch_max(admission.executing(), Ordering::SeqCst);
                            permit.release();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.executing(), 0);
    }

    #[test]
    fn test_ports_are_monotonic() {
        let ports = PortAllocator::new(40000);
        assert_eq!(ports.allocate(), Some(40000));
        assert_eq!(ports.allocate(), Some(40001));
        ports.release(40000);
        // Released ports are not handed out again until the sequence wraps.
        assert_eq!(ports.allocate(), Some(40002));
    }

    #[test]
    fn test_ports_wrap_and_skip_active() {
        let ports = PortAllocator::new(u16::MAX - 1);
        assert_eq!(ports.allocate(), Some(u16::MAX - 1));
        assert_eq!(ports.allocate(), Some(u16::MAX));
        assert_eq!(ports.allocate(), None);

        ports.release(u16::MAX);
        assert_eq!(ports.allocate(), Some(u16::MAX));
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let ports = PortAllocator::new(45000);
        let lease = ports.lease().unwrap();
        assert_eq!(lease.port(), 45000);
        assert_eq!(ports.in_use(), 1);
        drop(lease);
        assert_eq!(ports.in_use(), 0);
    }
}
