//! Credit ledger — balance and reservation bookkeeping for paid
//! physical-mail touches.

pub mod ledger;

pub use ledger::{
    CreditBalance, CreditLedger, CreditPackage, LedgerTransaction, TransactionKind,
};
