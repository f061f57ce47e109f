use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::cost::cost;
use crate::model::{Debit, OperationKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("budget exhausted: {operation} not authorized ({remaining} of {ceiling} remaining)")]
    BudgetExhausted {
        operation: &'static str,
        remaining: u64,
        ceiling: u64,
    },
}

/// Owned by one run. `debit` is only accepted right after a matching `authorize`.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    ceiling: u64,
    remaining: u64,
    pending: Option<OperationKind>,
    debits: Vec<Debit>,
}

impl BudgetLedger {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            remaining: ceiling,
            pending: None,
            debits: Vec::new(),
        }
    }

    /// Whether `operation` fits in the remaining budget. Does not spend.
    pub fn authorize(&mut self, operation: OperationKind) -> bool {
        let ok = self.remaining >= cost(operation);
        self.pending = ok.then_some(operation);
        if !ok {
            debug!(
                operation = operation.as_str(),
                remaining = self.remaining,
                "budget denied operation"
            );
        }
        ok
    }

    /// Record `operation` as issued.
    pub fn debit(&mut self, operation: OperationKind) -> Result<(), BudgetError> {
        let price = cost(operation);
        if self.pending.take() != Some(operation) || self.remaining < price {
            return Err(BudgetError::BudgetExhausted {
                operation: operation.as_str(),
                remaining: self.remaining,
                ceiling: self.ceiling,
            });
        }
        self.remaining -= price;
        self.debits.push(Debit {
            operation,
            cost: price,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn spent(&self) -> u64 {
        self.ceiling - self.remaining
    }

    pub fn debits(&self) -> &[Debit] {
        &self.debits
    }

    /// Debits recorded after the first `from` entries.
    pub fn debits_since(&self, from: usize) -> &[Debit] {
        self.debits.get(from..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationKind::*;

    #[test]
    fn authorize_then_debit_spends() {
        let mut ledger = BudgetLedger::new(5);
        assert!(ledger.authorize(FetchChildPage));
        ledger.debit(FetchChildPage).unwrap();
        assert_eq!(ledger.remaining(), 3);
        assert_eq!(ledger.spent(), 2);
        assert_eq!(ledger.debits().len(), 1);
        assert_eq!(ledger.debits()[0].cost, 2);
    }

    #[test]
    fn authorize_does_not_spend() {
        let mut ledger = BudgetLedger::new(1);
        assert!(ledger.authorize(FetchEntity));
        assert!(ledger.authorize(FetchEntity));
        assert_eq!(ledger.remaining(), 1);
    }

    #[test]
    fn debit_without_authorize_fails() {
        let mut ledger = BudgetLedger::new(10);
        let err = ledger.debit(FetchEntity).unwrap_err();
        assert!(matches!(err, BudgetError::BudgetExhausted { .. }));
        assert_eq!(ledger.remaining(), 10);
    }

    #[test]
    fn authorization_is_single_use() {
        let mut ledger = BudgetLedger::new(10);
        assert!(ledger.authorize(FetchEntity));
        ledger.debit(FetchEntity).unwrap();
        assert!(ledger.debit(FetchEntity).is_err());
        assert_eq!(ledger.remaining(), 9);
    }

    #[test]
    fn authorization_for_another_operation_does_not_count() {
        let mut ledger = BudgetLedger::new(10);
        assert!(ledger.authorize(FetchEntity));
        assert!(ledger.debit(FetchChildPage).is_err());
        assert_eq!(ledger.remaining(), 10);
    }

    #[test]
    fn denied_when_cost_exceeds_remaining() {
        let mut ledger = BudgetLedger::new(1);
        assert!(!ledger.authorize(FetchChildPage));
        assert!(ledger.debit(FetchChildPage).is_err());
        assert!(ledger.authorize(FetchEntity));
        ledger.debit(FetchEntity).unwrap();
        assert!(!ledger.authorize(FetchEntity));
        assert_eq!(ledger.remaining(), 0);
    }

    #[test]
    fn remaining_never_negative_over_mixed_sequence() {
        let ops = [FetchEntity, FetchChildPage, FetchGrandchildPage];
        let mut ledger = BudgetLedger::new(7);
        for i in 0..50usize {
            let op = ops[i % 3];
            let before = ledger.remaining();
            let authorized = ledger.authorize(op);
            // every other round tries to debit without a fresh authorization
            let result = if i % 4 == 3 {
                ledger.pending = None;
                ledger.debit(op)
            } else {
                ledger.debit(op)
            };
            if authorized && i % 4 != 3 {
                assert!(result.is_ok());
                assert_eq!(ledger.remaining(), before - cost(op));
            } else {
                assert!(result.is_err());
                assert_eq!(ledger.remaining(), before);
            }
            let total: u64 = ledger.debits().iter().map(|d| d.cost).sum();
            assert_eq!(ledger.remaining(), ledger.ceiling() - total);
        }
    }

    #[test]
    fn debits_since_slices_tail() {
        let mut ledger = BudgetLedger::new(10);
        for _ in 0..3 {
            assert!(ledger.authorize(FetchEntity));
            ledger.debit(FetchEntity).unwrap();
        }
        assert_eq!(ledger.debits_since(1).len(), 2);
        assert!(ledger.debits_since(5).is_empty());
    }
}
