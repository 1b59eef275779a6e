//! # threatfeed
//!
//! Scheduled, idempotent ingestion of threat-intelligence feeds (NVD CVEs,
//! OSV and GitHub advisories, the CISA KEV catalog, RSS/Atom advisories)
//! into canonical records that downstream consumers read.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  RunRequest  ┌─────────────┐   ┌────────────────────────┐
//! │ Scheduler │─────────────▶│ Worker pool │──▶│ RunCoordinator         │
//! └───────────┘   bounded    └─────────────┘   │  adapter → executor    │
//!       ▲          queue            ▲          │  → normalize → upsert  │
//!       │                           │          │  → cursor commit       │
//!  tick / reaper          POST /admin/run      └──────────┬─────────────┘
//!                                                         ▼
//!                                             ┌──────────────────────┐
//!                                             │ Store (SQLite / mem) │──▶ RecordHook
//!                                             └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! threatfeed init
//! threatfeed source add --kind CISA_KEV --label "CISA KEV"
//! threatfeed run CISA_KEV
//! threatfeed serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`clock`] | Injectable time source |
//! | [`rate_limiter`] | Per-source token buckets |
//! | [`fetch`] | Retry policy and HTTP fetch executor |
//! | [`cursor`] | Delta cursors and commit tracking |
//! | [`adapters`] | Per-kind fetch, paging and cursor logic |
//! | [`normalize`] | Raw item → canonical record, fingerprints |
//! | [`upsert`] | Idempotent batch persistence and hook firing |
//! | [`hooks`] | Downstream new/changed record events |
//! | [`store`] | Storage trait, SQLite and in-memory backends |
//! | [`coordinator`] | Run admission gates and pipeline |
//! | [`worker`] | Bounded run queue and worker pool |
//! | [`scheduler`] | Due-source detection and stale-run reaping |
//! | [`service`] | Engine composition |
//! | [`server`] | Admin and read HTTP API |
//! | [`sources`] | Data source registration and status tables |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapters;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod db;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod rate_limiter;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod sources;
pub mod store;
pub mod upsert;
pub mod worker;
