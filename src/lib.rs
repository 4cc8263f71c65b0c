//! # Rule Harness
//!
//! A detection-rule ingestion and search service for source-controlled
//! security rule sets.
//!
//! Rule Harness pulls rule definition files from a rule repository (GitHub
//! or a local checkout), parses each one into a normalized detection rule,
//! and publishes it idempotently into a searchable SQLite store, tracking
//! sync progress and a resumable checkpoint across runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌───────────┐
//! │ Rule Sources │──▶│   Pipeline    │──▶│  SQLite   │
//! │  GitHub/FS   │   │ Parse+Extract │   │ FTS5+Ckpt │
//! └──────────────┘   └───────────────┘   └────┬──────┘
//!                                             │
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                    ┌──────────┐       ┌──────────┐
//!                    │   CLI    │       │   HTTP   │
//!                    │(rulectl) │       │ control  │
//!                    └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rulectl init                    # create database
//! rulectl sync github             # ingest from the rule repository
//! rulectl search "powershell"     # keyword search over indexed rules
//! rulectl stats                   # store totals and checkpoint age
//! rulectl serve                   # start the HTTP control surface
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`parser`] | Rule definition format parser |
//! | [`fields`] | Field-name extraction from queries |
//! | [`source`] | Rule source trait and resolution |
//! | [`connector_github`] | GitHub Contents API source |
//! | [`connector_fs`] | Filesystem source |
//! | [`store`] | SQLite rule store and checkpoints |
//! | [`sync`] | Sync orchestration |
//! | [`server`] | HTTP control surface |

pub mod config;
pub mod connector_fs;
pub mod connector_github;
pub mod fields;
pub mod models;
pub mod parser;
pub mod search;
pub mod server;
pub mod source;
pub mod stats;
pub mod store;
pub mod sync;
