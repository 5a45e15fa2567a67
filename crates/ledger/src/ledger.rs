//! Credit ledger — balance, reservations, and an append-only transaction
//! log with `balance_after` snapshots. Reservations escrow credits for
//! in-flight direct-mail touches and always end in a commit or a release.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use drip_core::error::{DripError, DripResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a ledger transaction did to the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Reserve,
    Commit,
    Release,
    Refund,
}

/// One immutable ledger entry. The running `balance_after` snapshot makes
/// the log auditable independently of the mutable balance row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    /// Signed change to the spendable balance.
    pub delta: f64,
    pub balance_after: f64,
    /// Reservation, package, or refunded-transaction reference.
    pub reference: Option<Uuid>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the balance row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditBalance {
    pub balance: f64,
    pub reserved: f64,
    pub lifetime_purchased: f64,
    pub lifetime_used: f64,
    pub lifetime_refunded: f64,
}

/// A purchasable credit bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: f64,
    pub price_usd: f64,
}

#[derive(Debug, Default)]
struct LedgerState {
    balance: f64,
    reserved: f64,
    lifetime_purchased: f64,
    lifetime_used: f64,
    lifetime_refunded: f64,
    /// reservation id -> escrowed amount.
    reservations: HashMap<Uuid, f64>,
    transactions: Vec<LedgerTransaction>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Credit ledger. All mutations serialize on the balance-row mutex, so
/// concurrent reservations from multiple in-flight direct-mail touches can
/// never lose updates.
pub struct CreditLedger {
    state: Mutex<LedgerState>,
    packages: DashMap<String, CreditPackage>,
}

impl CreditLedger {
    pub fn new() -> Self {
        let ledger = Self {
            state: Mutex::new(LedgerState::default()),
            packages: DashMap::new(),
        };
        for package in Self::default_packages() {
            ledger.packages.insert(package.id.clone(), package);
        }
        ledger
    }

    fn default_packages() -> Vec<CreditPackage> {
        vec![
            CreditPackage {
                id: "starter-50".into(),
                name: "Starter 50".into(),
                credits: 50.0,
                price_usd: 39.0,
            },
            CreditPackage {
                id: "team-250".into(),
                name: "Team 250".into(),
                credits: 250.0,
                price_usd: 179.0,
            },
            CreditPackage {
                id: "office-1000".into(),
                name: "Office 1000".into(),
                credits: 1000.0,
                price_usd: 649.0,
            },
        ]
    }

    pub fn list_packages(&self) -> Vec<CreditPackage> {
        self.packages.iter().map(|p| p.value().clone()).collect()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Escrow `amount` for an in-flight direct-mail touch.
    pub fn reserve(&self, amount: f64, note: &str) -> DripResult<Uuid> {
        if amount <= 0.0 {
            return Err(DripError::Validation("reservation amount must be positive".into()));
        }

        let mut state = self.state.lock();
        if state.balance < amount {
            warn!(
                requested = amount,
                available = state.balance,
                "Credit reservation failed"
            );
            return Err(DripError::InsufficientBalance {
                requested: amount,
                available: state.balance,
            });
        }

        let reservation_id = Uuid::new_v4();
        state.balance -= amount;
        state.reserved += amount;
        state.reservations.insert(reservation_id, amount);
        Self::append(&mut state, TransactionKind::Reserve, -amount, Some(reservation_id), note);

        info!(reservation_id = %reservation_id, amount, "Credits reserved");
        Ok(reservation_id)
    }

    /// Convert a reservation into usage after a successful send.
    pub fn commit(&self, reservation_id: Uuid, note: &str) -> DripResult<LedgerTransaction> {
        let mut state = self.state.lock();
        let amount = state
            .reservations
            .remove(&reservation_id)
            .ok_or_else(|| DripError::NotFound(format!("reservation {reservation_id}")))?;

        state.reserved -= amount;
        state.lifetime_used += amount;
        let tx = Self::append(&mut state, TransactionKind::Commit, 0.0, Some(reservation_id), note);

        info!(reservation_id = %reservation_id, amount, "Reservation committed");
        Ok(tx)
    }

    /// Return an escrowed amount to the balance after a failed send.
    pub fn release(&self, reservation_id: Uuid, note: &str) -> DripResult<LedgerTransaction> {
        let mut state = self.state.lock();
        let amount = state
            .reservations
            .remove(&reservation_id)
            .ok_or_else(|| DripError::NotFound(format!("reservation {reservation_id}")))?;

        state.reserved -= amount;
        state.balance += amount;
        let tx = Self::append(&mut state, TransactionKind::Release, amount, Some(reservation_id), note);

        info!(reservation_id = %reservation_id, amount, "Reservation released");
        Ok(tx)
    }

    /// Buy a credit package.
    pub fn purchase(&self, package_id: &str) -> DripResult<LedgerTransaction> {
        let package = self
            .packages
            .get(package_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| DripError::NotFound(format!("credit package {package_id}")))?;

        let mut state = self.state.lock();
        state.balance += package.credits;
        state.lifetime_purchased += package.credits;
        let tx = Self::append(
            &mut state,
            TransactionKind::Purchase,
            package.credits,
            None,
            &format!("purchase {}", package.name),
        );

        info!(package_id, credits = package.credits, "Credits purchased");
        Ok(tx)
    }

    /// Refund a prior usage (commit) transaction — e.g. a mail piece the
    /// vendor could not fulfill. Credits return to the balance.
    pub fn refund(&self, transaction_id: Uuid, reason: &str) -> DripResult<LedgerTransaction> {
        let mut state = self.state.lock();

        let original = state
            .transactions
            .iter()
            .find(|t| t.id == transaction_id)
            .cloned()
            .ok_or_else(|| DripError::NotFound(format!("transaction {transaction_id}")))?;
        if original.kind != TransactionKind::Commit {
            return Err(DripError::Validation(
                "only usage transactions can be refunded".into(),
            ));
        }
        let reservation_ref = original
            .reference
            .ok_or_else(|| DripError::Validation("usage transaction has no reservation".into()))?;
        let already_refunded = state
            .transactions
            .iter()
            .any(|t| t.kind == TransactionKind::Refund && t.reference == Some(transaction_id));
        if already_refunded {
            return Err(DripError::Validation("transaction already refunded".into()));
        }

        // The committed amount is the delta of the reserve entry for the
        // same reservation.
        let amount = state
            .transactions
            .iter()
            .find(|t| t.kind == TransactionKind::Reserve && t.reference == Some(reservation_ref))
            .map(|t| -t.delta)
            .ok_or_else(|| DripError::Validation("reserve entry missing for refund".into()))?;

        state.balance += amount;
        state.lifetime_refunded += amount;
        let tx = Self::append(
            &mut state,
            TransactionKind::Refund,
            amount,
            Some(transaction_id),
            reason,
        );

        info!(transaction_id = %transaction_id, amount, reason, "Usage refunded");
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> CreditBalance {
        let state = self.state.lock();
        CreditBalance {
            balance: state.balance,
            reserved: state.reserved,
            lifetime_purchased: state.lifetime_purchased,
            lifetime_used: state.lifetime_used,
            lifetime_refunded: state.lifetime_refunded,
        }
    }

    pub fn statement(&self) -> Vec<LedgerTransaction> {
        self.state.lock().transactions.clone()
    }

    /// Recompute the balance from the transaction log. The ledger invariant
    /// is `audit() == snapshot().balance` (and `reserved >= 0`) after any
    /// sequence of operations.
    pub fn audit(&self) -> f64 {
        self.state.lock().transactions.iter().map(|t| t.delta).sum()
    }

    fn append(
        state: &mut LedgerState,
        kind: TransactionKind,
        delta: f64,
        reference: Option<Uuid>,
        note: &str,
    ) -> LedgerTransaction {
        let tx = LedgerTransaction {
            id: Uuid::new_v4(),
            kind,
            delta,
            balance_after: state.balance,
            reference,
            note: note.to_string(),
            created_at: Utc::now(),
        };
        state.transactions.push(tx.clone());
        tx
    }
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_reserve_commit_debits_usage() {
        let ledger = CreditLedger::new();
        ledger.purchase("starter-50").unwrap();

        let reservation = ledger.reserve(1.49, "postcard").unwrap();
        let snap = ledger.snapshot();
        assert_close(snap.balance, 48.51);
        assert_close(snap.reserved, 1.49);

        ledger.commit(reservation, "postcard sent").unwrap();
        let snap = ledger.snapshot();
        assert_close(snap.balance, 48.51);
        assert_close(snap.reserved, 0.0);
        assert_close(snap.lifetime_used, 1.49);
    }

    #[test]
    fn test_release_returns_escrow() {
        let ledger = CreditLedger::new();
        ledger.purchase("starter-50").unwrap();

        let reservation = ledger.reserve(5.0, "letter").unwrap();
        ledger.release(reservation, "send failed").unwrap();

        let snap = ledger.snapshot();
        assert_close(snap.balance, 50.0);
        assert_close(snap.reserved, 0.0);
        assert_close(snap.lifetime_used, 0.0);

        // A reservation can only end once.
        assert!(ledger.commit(reservation, "late").is_err());
    }

    #[test]
    fn test_insufficient_balance_is_typed_and_harmless() {
        let ledger = CreditLedger::new();
        // Scenario: balance 1.00, piece cost 1.49.
        ledger.purchase("starter-50").unwrap();
        let big = ledger.reserve(49.0, "drain").unwrap();
        ledger.commit(big, "drain").unwrap();
        assert_close(ledger.snapshot().balance, 1.0);

        let result = ledger.reserve(1.49, "postcard");
        match result {
            Err(DripError::InsufficientBalance { requested, available }) => {
                assert_close(requested, 1.49);
                assert_close(available, 1.0);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
        // Nothing deducted.
        assert_close(ledger.snapshot().balance, 1.0);
        assert_close(ledger.snapshot().reserved, 0.0);
    }

    #[test]
    fn test_refund_targets_usage_once() {
        let ledger = CreditLedger::new();
        ledger.purchase("starter-50").unwrap();
        let reservation = ledger.reserve(2.0, "letter").unwrap();
        let usage = ledger.commit(reservation, "letter sent").unwrap();

        let refund = ledger.refund(usage.id, "vendor lost the piece").unwrap();
        assert_close(refund.delta, 2.0);
        assert_close(ledger.snapshot().balance, 50.0);
        assert_close(ledger.snapshot().lifetime_refunded, 2.0);

        assert!(ledger.refund(usage.id, "again").is_err());
        // Purchases are not refundable through this path.
        let purchase_tx = ledger.statement()[0].clone();
        assert!(ledger.refund(purchase_tx.id, "nope").is_err());
    }

    #[test]
    fn test_balance_equals_sum_of_deltas() {
        let ledger = CreditLedger::new();
        ledger.purchase("team-250").unwrap();

        let r1 = ledger.reserve(1.49, "a").unwrap();
        let r2 = ledger.reserve(3.25, "b").unwrap();
        let usage = ledger.commit(r1, "a sent").unwrap();
        ledger.release(r2, "b failed").unwrap();
        ledger.purchase("starter-50").unwrap();
        ledger.refund(usage.id, "lost").unwrap();

        let snap = ledger.snapshot();
        assert_close(ledger.audit(), snap.balance);
        assert!(snap.reserved >= 0.0);
        // balance + reserved stays inside purchased - used + refunded.
        assert!(
            snap.balance + snap.reserved
                <= snap.lifetime_purchased - snap.lifetime_used + snap.lifetime_refunded + 1e-9
        );
    }

    #[test]
    fn test_concurrent_reservations_do_not_lose_updates() {
        use std::sync::Arc;

        let ledger = Arc::new(CreditLedger::new());
        ledger.purchase("office-1000").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..10 {
                let ledger = Arc::clone(&ledger);
                scope.spawn(move || {
                    for _ in 0..20 {
                        if let Ok(reservation) = ledger.reserve(1.0, "burst") {
                            ledger.commit(reservation, "burst sent").unwrap();
                        }
                    }
                });
            }
        });

        let snap = ledger.snapshot();
        assert_close(snap.lifetime_used, 200.0);
        assert_close(snap.balance, 800.0);
        assert_close(ledger.audit(), snap.balance);
    }
}
