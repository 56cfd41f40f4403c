//! Transaction identifiers.

/// A unique identifier for a transaction.
///
/// Identifiers are handed out by the [`TransactionManager`](super::TransactionManager)
/// starting from 1. The value 0 is the super transaction: it never appears
/// in the status file and is always treated as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The always-committed bootstrap transaction.
    pub const SUPER: TransactionId = TransactionId(0);

    /// Creates a new transaction ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_super(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}
