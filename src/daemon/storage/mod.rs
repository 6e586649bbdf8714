//! The persistence service the timer flushes into.
//!  - [store::JsonStore] keeps organizations, projects and tasks in a single `catalog.json`
//!    that is replaced atomically on every change.
//!  - Time entries are appended to `entries.jsonl`, one JSON object per line, so the frequent
//!    auto-save path never rewrites the whole history.
//!  - Both are cached in memory; the daemon is the only process that opens the data directory.

pub mod entities;
pub mod store;
