//! Which versions a transaction may see.

use crate::concurrency::mvcc::{IsolationLevel, Transaction};
use crate::transaction::{TransactionId, TransactionManager};

/// True when `t` may see the version stamped `(xmin, xmax)`.
pub fn is_visible(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: TransactionId,
    xmax: TransactionId,
) -> bool {
    if xmin == t.xid() && xmax.is_super() {
        return true;
    }
    match t.level() {
        IsolationLevel::ReadCommitted => read_committed(tm, t, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, t, xmin, xmax),
    }
}

fn read_committed(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: TransactionId,
    xmax: TransactionId,
) -> bool {
    if !tm.is_committed(xmin) {
        return false;
    }
    xmax.is_super() || (xmax != t.xid() && !tm.is_committed(xmax))
}

fn repeatable_read(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: TransactionId,
    xmax: TransactionId,
) -> bool {
    if !tm.is_committed(xmin) || xmin >= t.xid() || t.in_snapshot(xmin) {
        return false;
    }
    if xmax.is_super() {
        return true;
    }
    xmax != t.xid() && (!tm.is_committed(xmax) || xmax > t.xid() || t.in_snapshot(xmax))
}

/// True when `t` is about to overwrite a version already superseded by a
/// transaction it cannot see. Only repeatable read refuses this.
pub fn is_version_skip(tm: &TransactionManager, t: &Transaction, xmax: TransactionId) -> bool {
    match t.level() {
        IsolationLevel::ReadCommitted => false,
        IsolationLevel::RepeatableRead => {
            tm.is_committed(xmax) && (xmax > t.xid() || t.in_snapshot(xmax))
        }
    }
}
