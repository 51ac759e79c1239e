use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota budget exhausted: {spent} of {limit} units used, next request costs {cost}")]
pub struct QuotaExceeded {
    pub limit: u64,
    pub spent: u64,
    pub cost: u64,
}

/// Per-run quota budget shared by every in-flight request.
///
/// Units are reserved before a request is dispatched, never after it returns, so
/// concurrent callers cannot overshoot `limit`.
#[derive(Debug)]
pub struct QuotaBudget {
    limit: u64,
    spent: AtomicU64,
}

impl QuotaBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            spent: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.spent())
    }

    /// Reserve `cost` units, returning the new total spent.
    pub fn try_reserve(&self, cost: u64) -> Result<u64, QuotaExceeded> {
        let mut current = self.spent.load(Ordering::SeqCst);
        loop {
            let next = current
                .checked_add(cost)
                .filter(|next| *next <= self.limit)
                .ok_or(QuotaExceeded {
                    limit: self.limit,
                    spent: current,
                    cost,
                })?;
            match self
                .spent
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }
}
