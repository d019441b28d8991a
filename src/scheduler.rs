use anyhow::bail;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// How thread-level countdown crossings become slice emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePolicy {
    /// Every per-thread crossing emits that thread's own slice.
    SingleThread,
    /// One shared countdown; the thread whose decrement straddles zero
    /// emits one slice covering all threads.
    GlobalAggregate,
    /// A shared slice ends as soon as any one thread consumes
    /// `sliceLength / N` instructions; leftover countdown carries over.
    ThreadProgress(u32),
}

impl ScopePolicy {
    /// Whether slices aggregate all threads into one shared scope.
    pub fn is_global(&self) -> bool {
        !matches!(self, ScopePolicy::SingleThread)
    }

    /// Per-thread countdown budget under this policy.
    pub fn thread_budget(&self, slice_size: i64) -> i64 {
        match self {
            ScopePolicy::ThreadProgress(n) => (slice_size / *n as i64).max(1),
            _ => slice_size,
        }
    }
}

impl FromStr for ScopePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "single" => Ok(ScopePolicy::SingleThread),
            "global" => Ok(ScopePolicy::GlobalAggregate),
            _ => {
                if let Some(n) = s.strip_prefix("thread-progress:") {
                    let n: u32 = n.parse()?;
                    if n == 0 {
                        bail!("thread-progress divisor must be at least 1");
                    }
                    Ok(ScopePolicy::ThreadProgress(n))
                } else {
                    bail!("unknown scope policy {s:?}, expected single, global or thread-progress:N");
                }
            }
        }
    }
}

impl fmt::Display for ScopePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePolicy::SingleThread => write!(f, "single"),
            ScopePolicy::GlobalAggregate => write!(f, "global"),
            ScopePolicy::ThreadProgress(n) => write!(f, "thread-progress:{n}"),
        }
    }
}

/// Per-thread instruction countdown. Crossing below zero fires at most one
/// interval end per consume call, however large the region.
pub struct SliceTimer {
    remaining: i64,
}

impl SliceTimer {
    pub fn new(budget: i64) -> Self {
        Self { remaining: budget }
    }

    /// Subtract one region execution; true when the countdown crossed zero.
    pub fn consume(&mut self, insts: i64) -> bool {
        self.remaining -= insts;
        self.remaining < 0
    }

    /// Reset to a full budget (single-thread policy).
    pub fn recharge(&mut self, budget: i64) {
        self.remaining = budget;
    }

    /// Add one budget, keeping the overshoot deficit (thread-progress).
    pub fn extend(&mut self, budget: i64) {
        self.remaining += budget;
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }
}

/// Shared countdown for the global-aggregate policy. All threads decrement
/// it; exactly one observes the straddle per interval.
pub struct GlobalTimer {
    remaining: AtomicI64,
}

impl GlobalTimer {
    pub fn new(budget: i64) -> Self {
        Self {
            remaining: AtomicI64::new(budget),
        }
    }

    /// Subtract one region execution; true for exactly the decrement that
    /// takes the countdown from non-negative to negative.
    pub fn consume(&self, insts: i64) -> bool {
        let prev = self.remaining.fetch_sub(insts, Ordering::Relaxed);
        prev >= 0 && prev - insts < 0
    }

    pub fn recharge(&self, budget: i64) {
        self.remaining.store(budget, Ordering::Relaxed);
    }
}
