//! Soft-reservation bookkeeping over declared CPU/RAM/disk capacity
//!.
//!
//! The ledger never commits reservations above `total * (1 - threshold)`.
//! `reserve`/`check`/`free` are serialised under a single mutex guarding all
//! three dimensions together, so a reservation can never observe (or leave)
//! the triple half-updated.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A CPU/RAM/disk triple. CPU is fractional cores, RAM is MiB, disk is GiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}

impl Capacity {
    pub const ZERO: Capacity = Capacity { cpu: 0.0, ram: 0.0, disk: 0.0 };

    fn sub_clamped(self, rhs: Capacity) -> Capacity {
        Capacity {
            cpu: (self.cpu - rhs.cpu).max(0.0),
            ram: (self.ram - rhs.ram).max(0.0),
            disk: (self.disk - rhs.disk).max(0.0),
        }
    }

    fn add(self, rhs: Capacity) -> Capacity {
        Capacity {
            cpu: self.cpu + rhs.cpu,
            ram: self.ram + rhs.ram,
            disk: self.disk + rhs.disk,
        }
    }
}

/// Anything that can state its minimum CoS requirement on the three
/// admission dimensions — the agent only gates on `{min_cpu, min_ram,
/// min_disk}` in the core.
pub trait Requirement {
    fn min_cpu(&self) -> f64;
    fn min_ram(&self) -> f64;
    fn min_disk(&self) -> f64;

    fn as_capacity(&self) -> Capacity {
        Capacity {
            cpu: self.min_cpu(),
            ram: self.min_ram(),
            disk: self.min_disk(),
        }
    }
}

/// Where `snapshot` sources its "free" numbers from: `Simulated` tracks
/// reservations against the node's declared totals; `Measured` tracks them
/// against a live free-capacity reading handed in by the caller (raw OS
/// monitoring stays an external collaborator — the ledger only ever
/// consumes a value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Simulated,
    Measured,
}

/// Clamps a `RESOURCE_LIMIT` percentage to `[0, 100]` and returns the
/// complementary threshold fraction. Out-of-range limit clamps to 0, i.e.
/// threshold 1, no capacity offered.
pub fn threshold_from_limit_percent(limit_percent: f64) -> f64 {
    let clamped = if (0.0..=100.0).contains(&limit_percent) {
        limit_percent
    } else {
        0.0
    };
    1.0 - clamped / 100.0
}

/// The resource ledger itself.
pub struct ResourceLedger {
    totals: Capacity,
    threshold: f64,
    mode: Mode,
    reserved: Mutex<Capacity>,
}

impl ResourceLedger {
    pub fn new(totals: Capacity, limit_percent: f64, mode: Mode) -> Self {
        Self {
            totals,
            threshold: threshold_from_limit_percent(limit_percent),
            mode,
            reserved: Mutex::new(Capacity::ZERO),
        }
    }

    pub fn totals(&self) -> Capacity {
        self.totals
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// `measured_free` is required (and used) only in `Mode::Measured`; it
    /// represents the live free-capacity reading before this ledger's own
    /// reservations are subtracted.
    pub fn snapshot(&self, measured_free: Option<Capacity>) -> Capacity {
        let reserved = *self.reserved.lock().expect("ledger mutex poisoned");
        let base = match self.mode {
            Mode::Simulated => self.totals,
            Mode::Measured => measured_free.unwrap_or(self.totals),
        };
        base.sub_clamped(reserved)
    }

    fn headroom(&self) -> Capacity {
        Capacity {
            cpu: self.totals.cpu * self.threshold,
            ram: self.totals.ram * self.threshold,
            disk: self.totals.disk * self.threshold,
        }
    }

    fn fits(free: Capacity, need: Capacity, headroom: Capacity) -> bool {
        free.cpu - need.cpu >= headroom.cpu
            && free.ram - need.ram >= headroom.ram
            && free.disk - need.disk >= headroom.disk
    }

    /// True iff `free - req.min >= total * threshold` on every dimension.
    pub fn check(&self, req: &impl Requirement, measured_free: Option<Capacity>) -> bool {
        let free = self.snapshot(measured_free);
        let need = req.as_capacity();
        let headroom = self.headroom();
        debug!(?free, ?need, "admission check");
        Self::fits(free, need, headroom)
    }

    /// Atomically re-evaluates `check`; on success commits `req.min` into
    /// the reserved triple and returns `true`.
    pub fn reserve(&self, req: &impl Requirement, measured_free: Option<Capacity>) -> bool {
        let mut reserved = self.reserved.lock().expect("ledger mutex poisoned");
        let base = match self.mode {
            Mode::Simulated => self.totals,
            Mode::Measured => measured_free.unwrap_or(self.totals),
        };
        let free = base.sub_clamped(*reserved);
        let need = req.as_capacity();
        let headroom = self.headroom();
        if Self::fits(free, need, headroom) {
            *reserved = reserved.add(need);
            debug!(?need, total_reserved = ?*reserved, "reserved");
            true
        } else {
            false
        }
    }

    /// Subtracts `req.min` from the reserved triple, clamping each
    /// dimension at zero. Idempotent against the `freed` flag the caller
    /// (`ProviderRequest`) maintains — this call itself has no memory of
    /// which request it was for.
    pub fn free(&self, req: &impl Requirement) {
        let mut reserved = self.reserved.lock().expect("ledger mutex poisoned");
        *reserved = reserved.sub_clamped(req.as_capacity());
        debug!(total_reserved = ?*reserved, "freed");
    }

    /// Net reserved amount, for ledger-audit assertions in tests: every
    /// successful `reserve` is balanced by exactly one `free`.
    pub fn reserved(&self) -> Capacity {
        *self.reserved.lock().expect("ledger mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req {
        cpu: f64,
        ram: f64,
        disk: f64,
    }

    impl Requirement for Req {
        fn min_cpu(&self) -> f64 {
            self.cpu
        }
        fn min_ram(&self) -> f64 {
            self.ram
        }
        fn min_disk(&self) -> f64 {
            self.disk
        }
    }

    fn ledger() -> ResourceLedger {
        ResourceLedger::new(
            Capacity { cpu: 4.0, ram: 2048.0, disk: 20.0 },
            0.0,
            Mode::Simulated,
        )
    }

    #[test]
    fn limit_outside_0_100_clamps_to_zero_capacity() {
        let t_neg = threshold_from_limit_percent(-5.0);
        let t_over = threshold_from_limit_percent(150.0);
        assert_eq!(t_neg, 1.0);
        assert_eq!(t_over, 1.0);
    }

    #[test]
    fn reserve_then_free_returns_to_zero() {
        let l = ledger();
        let req = Req { cpu: 1.0, ram: 512.0, disk: 5.0 };
        assert!(l.reserve(&req, None));
        assert_eq!(l.reserved().cpu, 1.0);
        l.free(&req);
        assert_eq!(l.reserved(), Capacity::ZERO);
    }

    #[test]
    fn reserve_fails_when_insufficient() {
        let l = ledger();
        let too_big = Req { cpu: 100.0, ram: 0.0, disk: 0.0 };
        assert!(!l.reserve(&too_big, None));
        assert_eq!(l.reserved(), Capacity::ZERO);
    }

    #[test]
    fn free_never_goes_negative() {
        let l = ledger();
        let req = Req { cpu: 1.0, ram: 1.0, disk: 1.0 };
        l.free(&req); // freed without ever reserving
        assert_eq!(l.reserved(), Capacity::ZERO);
    }

    #[test]
    fn threshold_headroom_is_respected() {
        // threshold 0.5 -> never commit above half of declared totals
        let l = ResourceLedger::new(Capacity { cpu: 4.0, ram: 1000.0, disk: 10.0 }, 50.0, Mode::Simulated);
        let half = Req { cpu: 2.0, ram: 500.0, disk: 5.0 };
        assert!(l.reserve(&half, None));
        let another = Req { cpu: 0.1, ram: 0.0, disk: 0.0 };
        assert!(!l.reserve(&another, None), "must not exceed total*(1-threshold) headroom");
    }

    #[test]
    fn measured_mode_uses_supplied_free_snapshot() {
        let l = ResourceLedger::new(Capacity { cpu: 4.0, ram: 2048.0, disk: 20.0 }, 0.0, Mode::Measured);
        let measured = Capacity { cpu: 1.0, ram: 256.0, disk: 2.0 };
        let need = Req { cpu: 0.5, ram: 100.0, disk: 1.0 };
        assert!(l.check(&need, Some(measured)));
        let too_much = Req { cpu: 2.0, ram: 0.0, disk: 0.0 };
        assert!(!l.check(&too_much, Some(measured)));
    }
}
