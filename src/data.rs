//! Data manager: addressable records stored in pages.
//!
//! A record is a DataItem `[ValidFlag:1][Size:2][Data:Size]` at a fixed
//! offset of a page, addressed by a [`Uid`]. Every in-place change goes
//! through the before/after protocol so the log can redo or undo it.

pub mod item;
pub mod journal;
pub mod manager;

pub use item::{DataItem, DataItemWriter, Uid};
pub use manager::{DataItemRef, DataManager};
