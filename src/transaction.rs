//! Transaction management module.
//!
//! This module provides the durable record of transaction outcome:
//! - Transaction identifiers, including the always-committed super transaction
//! - The Active / Committed / Aborted status byte
//! - The status file and its point-read mirror

pub mod id;
pub mod manager;
pub mod state;

// Re-export commonly used types
pub use id::TransactionId;
pub use manager::TransactionManager;
pub use state::TransactionState;
