//! Two-level concurrency admission: one budget per lane plus an aggregate.
//!
//! A slot is granted only when both the lane counter and the total counter
//! have headroom; both are incremented under the same lock. The returned
//! `Ticket` owns the slot and gives it back exactly once, either through
//! `Ticket::release` or when dropped (early return, error, panic, timeout).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{GateError, Result};
use crate::types::Lane;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneLimits {
    #[serde(default = "default_webhook")]
    pub webhook: usize,
    #[serde(default = "default_trigger")]
    pub trigger: usize,
    #[serde(default = "default_scheduler")]
    pub scheduler: usize,
    #[serde(default = "default_bridge")]
    pub bridge: usize,
}

fn default_webhook() -> usize {
    4
}

fn default_trigger() -> usize {
    4
}

fn default_scheduler() -> usize {
    2
}

fn default_bridge() -> usize {
    2
}

impl Default for LaneLimits {
    fn default() -> Self {
        Self {
            webhook: default_webhook(),
            trigger: default_trigger(),
            scheduler: default_scheduler(),
            bridge: default_bridge(),
        }
    }
}

impl LaneLimits {
    pub fn cap(&self, lane: Lane) -> usize {
        match lane {
            Lane::Webhook => self.webhook,
            Lane::Trigger => self.trigger,
            Lane::Scheduler => self.scheduler,
            Lane::Bridge => self.bridge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub lanes: LaneLimits,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub in_use: usize,
    pub cap: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub lanes: BTreeMap<Lane, Usage>,
    pub total: Usage,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Counters {
    limits: Limits,
    in_use: [usize; 4],
    total: usize,
    outstanding: HashSet<u64>,
    next_id: u64,
}

struct Inner {
    counters: Mutex<Counters>,
    freed: Condvar,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Counters>> {
        self.counters
            .lock()
            .map_err(|_| GateError::Internal("admission counters lock poisoned".into()))
    }

    fn release(&self, id: u64, lane: Lane) -> Result<()> {
        let mut c = self.lock()?;
        if !c.outstanding.remove(&id) {
            tracing::error!(ticket = id, lane = %lane, "release of a ticket that is not held");
            return Err(GateError::Internal(format!(
                "ticket {id} for lane {lane} is not held"
            )));
        }
        let i = lane.index();
        if c.in_use[i] == 0 || c.total == 0 {
            return Err(GateError::Internal(format!(
                "admission counter underflow on lane {lane}"
            )));
        }
        c.in_use[i] -= 1;
        c.total -= 1;
        drop(c);
        self.freed.notify_all();
        Ok(())
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Mutex::new(Counters {
                    limits,
                    in_use: [0; 4],
                    total: 0,
                    outstanding: HashSet::new(),
                    next_id: 1,
                }),
                freed: Condvar::new(),
            }),
        }
    }

    /// Take a slot on `lane` and on the aggregate, or fail immediately.
    pub fn try_acquire(&self, lane: Lane) -> Result<Ticket> {
        let mut c = self.inner.lock()?;
        self.grab(&mut c, lane)
            .ok_or_else(|| GateError::ConcurrencyExceeded {
                lane: lane.to_string(),
            })
    }

    /// Wait up to `wait` for a slot. On timeout nothing is held.
    pub fn acquire(&self, lane: Lane, wait: Duration) -> Result<Ticket> {
        if wait.is_zero() {
            return self.try_acquire(lane);
        }
        let deadline = Instant::now() + wait;
        let mut c = self.inner.lock()?;
        loop {
            if let Some(ticket) = self.grab(&mut c, lane) {
                return Ok(ticket);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GateError::ConcurrencyExceeded {
                    lane: lane.to_string(),
                });
            }
            let (guard, _) = self
                .inner
                .freed
                .wait_timeout(c, deadline - now)
                .map_err(|_| GateError::Internal("admission counters lock poisoned".into()))?;
            c = guard;
        }
    }

    fn grab(&self, c: &mut Counters, lane: Lane) -> Option<Ticket> {
        let i = lane.index();
        if c.in_use[i] >= c.limits.lanes.cap(lane) || c.total >= c.limits.total {
            return None;
        }
        c.in_use[i] += 1;
        c.total += 1;
        let id = c.next_id;
        c.next_id += 1;
        c.outstanding.insert(id);
        Some(Ticket {
            id,
            lane,
            inner: Some(Arc::clone(&self.inner)),
        })
    }

    /// Apply new caps. Slots already held stay held; lanes above a lowered
    /// cap simply admit nothing until they drain below it.
    pub fn set_limits(&self, limits: Limits) -> Result<()> {
        let mut c = self.inner.lock()?;
        c.limits = limits;
        drop(c);
        self.inner.freed.notify_all();
        Ok(())
    }

    pub fn snapshot(&self) -> Result<AdmissionSnapshot> {
        let c = self.inner.lock()?;
        let lanes = Lane::all()
            .iter()
            .map(|&lane| {
                (
                    lane,
                    Usage {
                        in_use: c.in_use[lane.index()],
                        cap: c.limits.lanes.cap(lane),
                    },
                )
            })
            .collect();
        Ok(AdmissionSnapshot {
            lanes,
            total: Usage {
                in_use: c.total,
                cap: c.limits.total,
            },
        })
    }

    /// Counter bookkeeping must agree with the set of outstanding tickets.
    pub fn check_invariants(&self) -> Result<()> {
        let c = self.inner.lock()?;
        let lane_sum: usize = c.in_use.iter().sum();
        if lane_sum != c.total || c.total != c.outstanding.len() {
            return Err(GateError::Internal(format!(
                "admission counters disagree: lanes={lane_sum} total={} outstanding={}",
                c.total,
                c.outstanding.len()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// One held slot on a lane and on the aggregate.
pub struct Ticket {
    id: u64,
    lane: Lane,
    inner: Option<Arc<Inner>>,
}

impl Ticket {
    pub fn release(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.release(self.id, self.lane),
            None => Ok(()),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(e) = inner.release(self.id, self.lane) {
                tracing::error!(error = %e, "admission ticket release failed on drop");
            }
        }
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn limits(lane_cap: usize, total: usize) -> Limits {
        Limits {
            lanes: LaneLimits {
                webhook: lane_cap,
                trigger: lane_cap,
                scheduler: lane_cap,
                bridge: lane_cap,
            },
            total,
        }
    }

    #[test]
    fn lane_cap_admits_exactly_l_of_l_plus_one() {
        let ctl = AdmissionController::new(limits(3, 10));
        let admitted = AtomicUsize::new(0);
        let held = Mutex::new(Vec::new());
        let barrier = Barrier::new(4);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    if let Ok(t) = ctl.try_acquire(Lane::Webhook) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        held.lock().unwrap().push(t);
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        ctl.check_invariants().unwrap();
        drop(held);
        assert_eq!(ctl.snapshot().unwrap().total.in_use, 0);
    }

    #[test]
    fn aggregate_cap_bounds_all_lanes() {
        let ctl = AdmissionController::new(limits(3, 5));
        let mut held = Vec::new();
        let mut rejected = 0;
        for lane in Lane::all() {
            for _ in 0..3 {
                match ctl.try_acquire(*lane) {
                    Ok(t) => held.push(t),
                    Err(GateError::ConcurrencyExceeded { .. }) => rejected += 1,
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        }
        assert_eq!(held.len(), 5);
        assert_eq!(rejected, 7);
        ctl.check_invariants().unwrap();
    }

    #[test]
    fn noisy_lane_does_not_starve_others() {
        let ctl = AdmissionController::new(limits(2, 4));
        let _a = ctl.try_acquire(Lane::Webhook).unwrap();
        let _b = ctl.try_acquire(Lane::Webhook).unwrap();
        assert!(ctl.try_acquire(Lane::Webhook).is_err());
        assert!(ctl.try_acquire(Lane::Scheduler).is_ok());
    }

    #[test]
    fn release_frees_both_counters() {
        let ctl = AdmissionController::new(limits(1, 1));
        let t = ctl.try_acquire(Lane::Trigger).unwrap();
        assert!(ctl.try_acquire(Lane::Bridge).is_err());
        t.release().unwrap();
        let snap = ctl.snapshot().unwrap();
        assert_eq!(snap.total.in_use, 0);
        assert_eq!(snap.lanes[&Lane::Trigger].in_use, 0);
        assert!(ctl.try_acquire(Lane::Bridge).is_ok());
    }

    #[test]
    fn drop_releases_ticket() {
        let ctl = AdmissionController::new(limits(1, 1));
        {
            let _t = ctl.try_acquire(Lane::Webhook).unwrap();
        }
        assert!(ctl.try_acquire(Lane::Webhook).is_ok());
    }

    #[test]
    fn unknown_ticket_release_is_an_error() {
        let ctl = AdmissionController::new(limits(2, 2));
        let _held = ctl.try_acquire(Lane::Webhook).unwrap();
        let forged = Ticket {
            id: 9_999,
            lane: Lane::Webhook,
            inner: Some(Arc::clone(&ctl.inner)),
        };
        let err = forged.release().unwrap_err();
        assert!(matches!(err, GateError::Internal(_)));
        assert_eq!(ctl.snapshot().unwrap().total.in_use, 1);
        ctl.check_invariants().unwrap();
    }

    #[test]
    fn acquire_times_out_without_holding_anything() {
        let ctl = AdmissionController::new(limits(1, 1));
        let _t = ctl.try_acquire(Lane::Webhook).unwrap();
        let err = ctl
            .acquire(Lane::Webhook, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, GateError::ConcurrencyExceeded { .. }));
        assert_eq!(ctl.snapshot().unwrap().total.in_use, 1);
        ctl.check_invariants().unwrap();
    }

    #[test]
    fn acquire_wakes_when_slot_frees() {
        let ctl = AdmissionController::new(limits(1, 1));
        let t = ctl.try_acquire(Lane::Webhook).unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| ctl.acquire(Lane::Webhook, Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(20));
            drop(t);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_eq!(ctl.snapshot().unwrap().total.in_use, 0);
    }

    #[test]
    fn stress_with_panics_never_leaks() {
        let ctl = AdmissionController::new(limits(3, 6));
        std::thread::scope(|s| {
            for worker in 0..12 {
                let ctl = ctl.clone();
                s.spawn(move || {
                    for round in 0..200 {
                        let lane = Lane::all()[(worker + round) % 4];
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            if let Ok(ticket) = ctl.try_acquire(lane) {
                                if round % 7 == 0 {
                                    panic!("induced failure while holding a ticket");
                                }
                                if round % 2 == 0 {
                                    ticket.release().unwrap();
                                }
                            }
                        }));
                        let _ = result;
                        ctl.check_invariants().unwrap();
                    }
                });
            }
        });
        let snap = ctl.snapshot().unwrap();
        assert_eq!(snap.total.in_use, 0);
        assert!(snap.lanes.values().all(|u| u.in_use == 0));
    }

    #[test]
    fn lowered_limits_apply_to_new_requests() {
        let ctl = AdmissionController::new(limits(4, 4));
        let _a = ctl.try_acquire(Lane::Webhook).unwrap();
        let _b = ctl.try_acquire(Lane::Webhook).unwrap();
        ctl.set_limits(limits(1, 4)).unwrap();
        assert!(ctl.try_acquire(Lane::Webhook).is_err());
        assert!(ctl.try_acquire(Lane::Trigger).is_ok());
        ctl.check_invariants().unwrap();
    }
}
