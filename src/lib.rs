pub mod cache;
pub mod concurrency;
pub mod data;
pub mod database;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod transaction;
