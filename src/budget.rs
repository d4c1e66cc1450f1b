//! Time budget allocation
//!
//! The script-execution pool is the total budget minus the time reserved for
//! the mandatory phases. Each port draws from the pool when its scripts are
//! about to run: `per_script = min(cap, remaining / scripts)`, and the whole
//! nominal amount for the port is reserved up front. All draws go through one
//! mutex so concurrent ports can never spend the same time twice.

use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;

/// Deadline for a mandatory phase: its own cap, never beyond the total budget
pub fn phase_deadline(phase_cap: Duration, total_budget: Duration) -> Duration {
    phase_cap.min(total_budget)
}

/// Time granted to one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    pub per_script: Duration,
    /// Scripts covered by the grant; lower than requested only when the
    /// pool has fewer milliseconds left than scripts pending
    pub granted: usize,
    pub requested: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Granted(PortAllocation),
    /// Nothing left; `first` is set for the first refusal only
    Exhausted { first: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub pool: Duration,
    pub remaining: Duration,
    /// Sum of nominal grants
    pub allocated: Duration,
    /// Wall-clock time actually used by scripts
    pub consumed: Duration,
}

#[derive(Debug)]
struct Ledger {
    pool: Duration,
    remaining: Duration,
    allocated: Duration,
    consumed: Duration,
    exhaustion_reported: bool,
}

/// Shared, serialized script-execution budget
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    ledger: Arc<Mutex<Ledger>>,
    per_script_cap: Duration,
}

impl BudgetAllocator {
    pub fn new(total_budget: Duration, reserved: Duration, per_script_cap: Duration) -> Self {
        let pool = total_budget.saturating_sub(reserved);
        tracing::debug!(
            total_ms = total_budget.as_millis() as u64,
            reserved_ms = reserved.as_millis() as u64,
            pool_ms = pool.as_millis() as u64,
            "Script budget initialised"
        );
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                pool,
                remaining: pool,
                allocated: Duration::ZERO,
                consumed: Duration::ZERO,
                exhaustion_reported: false,
            })),
            per_script_cap,
        }
    }

    pub fn per_script_cap(&self) -> Duration {
        self.per_script_cap
    }

    pub async fn remaining(&self) -> Duration {
        self.ledger.lock().await.remaining
    }

    /// Reserve time for `scripts` sequential runs on one port
    pub async fn allocate(&self, scripts: usize) -> Allocation {
        let mut ledger = self.ledger.lock().await;

        if scripts == 0 {
            return Allocation::Granted(PortAllocation {
                per_script: Duration::ZERO,
                granted: 0,
                requested: 0,
            });
        }

        let remaining_ms = u64::try_from(ledger.remaining.as_millis()).unwrap_or(u64::MAX);
        if remaining_ms == 0 {
            let first = !ledger.exhaustion_reported;
            ledger.exhaustion_reported = true;
            return Allocation::Exhausted { first };
        }

        let granted = scripts.min(usize::try_from(remaining_ms).unwrap_or(usize::MAX));
        let cap_ms = u64::try_from(self.per_script_cap.as_millis()).unwrap_or(u64::MAX);
        let per_ms = (remaining_ms / granted as u64).min(cap_ms).max(1);
        let per_script = Duration::from_millis(per_ms);
        let total = per_script * granted as u32;

        ledger.remaining = ledger.remaining.saturating_sub(total);
        ledger.allocated += total;

        Allocation::Granted(PortAllocation {
            per_script,
            granted,
            requested: scripts,
        })
    }

    /// Record the wall-clock time one script actually took
    pub async fn record_consumed(&self, elapsed: Duration) {
        self.ledger.lock().await.consumed += elapsed;
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.ledger.lock().await;
        BudgetSnapshot {
            pool: ledger.pool,
            remaining: ledger.remaining,
            allocated: ledger.allocated,
            consumed: ledger.consumed,
        }
    }
}
