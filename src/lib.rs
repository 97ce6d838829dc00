//! # minibulk
//!
//! Write router for a sharded document store:
//! - Targets each insert/update/delete of a bulk request at the shards owning its data
//! - Groups writes into per-shard batches under ordered or unordered semantics
//! - Fans batches out in parallel and merges per-op results into one reply
//! - Refreshes stale routing metadata and retries, with a bounded no-progress budget
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            BulkWriteRequest
//!                   │
//! ┌─────────────────▼───────────────────────┐
//! │ execute (retry loop)                    │
//! │   target ─► dispatch ─► merge ─► refresh│
//! └──────┬───────────────┬──────────────────┘
//!        │ Targeter      │ ShardClient
//! ┌──────▼──────┐   ┌────▼─────┬──────────┐
//! │ routing     │   │ Shard A  │ Shard B  │
//! │ catalog     │   │ executor │ executor │
//! └─────────────┘   └──────────┴──────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a request against configured shards
//! ```bash
//! minibulk exec --request ./request.json --catalog ./catalog.json
//! ```
//!
//! ### Show the first round without sending anything
//! ```bash
//! minibulk explain --request ./request.json --catalog ./catalog.json
//! ```

pub mod command;
pub mod common;
pub mod router;

// Re-export commonly used types
pub use command::{BulkWriteReplyInfo, BulkWriteRequest, WriteOperation};
pub use common::{Config, Error, Result};
pub use router::execute;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
