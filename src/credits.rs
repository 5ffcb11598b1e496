//! Process-wide credit ledger.
//!
//! Every completion, whatever session it belongs to, is recorded here so an
//! operator can see total spend across concurrent cascades. Updates are
//! lock-free; cost is held in integral microdollars to stay atomic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

#[derive(Debug, Default)]
pub struct CreditLedger {
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    cost_micros: AtomicU64,
    completions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CreditSnapshot {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub completions: u64,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens_in: u64, tokens_out: u64, cost: f64) {
        self.tokens_in.fetch_add(tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(tokens_out, Ordering::Relaxed);
        let micros = (cost.max(0.0) * MICROS_PER_DOLLAR).round() as u64;
        self.cost_micros.fetch_add(micros, Ordering::Relaxed);
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CreditSnapshot {
        CreditSnapshot {
            tokens_in: self.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.tokens_out.load(Ordering::Relaxed),
            cost: self.cost_micros.load(Ordering::Relaxed) as f64 / MICROS_PER_DOLLAR,
            completions: self.completions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_totals() {
        let ledger = CreditLedger::new();
        ledger.record(100, 20, 0.0125);
        ledger.record(50, 10, 0.0075);

        let snap = ledger.snapshot();
        assert_eq!(snap.tokens_in, 150);
        assert_eq!(snap.tokens_out, 30);
        assert_eq!(snap.completions, 2);
        assert!((snap.cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn concurrent_updates_do_not_lose_counts() {
        let ledger = std::sync::Arc::new(CreditLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    ledger.record(1, 1, 0.000001);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = ledger.snapshot();
        assert_eq!(snap.tokens_in, 8000);
        assert_eq!(snap.completions, 8000);
    }
}
