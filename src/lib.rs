//! tunesync: asynchronous library-synchronization pipeline.
//!
//! Three cooperating parts: a paginated, credential-aware catalog fetcher
//! (`catalog`), a dependency-ordered task pipeline over a shared queue
//! (`sync` + `worker` + `db`), and a notification relay with websocket
//! fan-out and acknowledgement tracking (`relay`).

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod model;
pub mod relay;
pub mod sync;
pub mod worker;

pub use error::{SyncError, SyncResult};
