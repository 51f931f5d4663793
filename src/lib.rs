//! pymirror - Incremental, crash-safe PyPI package index mirror
//!
//! pymirror maintains a complete local replica of a remote package index by
//! consuming its serial-numbered changelog, fetching per-project metadata
//! and distribution files, and materializing them as a standards-compliant
//! index file tree. Runs can be killed at any point and resumed without
//! corrupting the replica or losing track of progress.
//!
//! ## Core Components
//!
//! - **Mirror Engine**: changelog-driven work set determination, bounded
//!   worker pool, durable serial finalization
//! - **Package Sync**: per-project fetch -> filter -> verify -> publish
//!   state machine
//! - **Filter Pipeline**: composable project/release/file admission control
//! - **Storage Abstraction**: atomic publication over pluggable backends
//! - **Index Generator**: PEP 503 HTML and PEP 691 JSON simple pages
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`mirror`]: The synchronization engine
//! - [`package`]: The per-project state machine
//! - [`filters`]: Admission filters and their registry
//! - [`storage`]: Backend contract and implementations

pub mod config;
pub mod delete;
pub mod errors;
pub mod filters;
pub mod layout;
pub mod metadata;
pub mod mirror;
pub mod package;
pub mod simple;
pub mod state;
pub mod storage;
pub mod upstream;
pub mod verify;
pub mod version;

pub use config::Config;
pub use errors::{StorageError, SyncError};
pub use mirror::{MirrorEngine, MirrorSummary};
pub use package::{Package, PackageOutcome, PackageSyncer};
pub use storage::{create_storage, Storage};
pub use upstream::UpstreamClient;
