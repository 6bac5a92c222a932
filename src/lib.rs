//! # rs-onyx
//!
//! A one-way bridge that mirrors a RepairShopr shop (customers, assets,
//! tickets, invoices) into an Onyx knowledge base.
//!
//! Records are pulled page by page from the RepairShopr v1 API under a
//! token-bucket rate limit, deduplicated, rendered into search documents
//! and posted to Onyx's ingestion endpoint. Progress is checkpointed to a
//! JSON file after every batch so an interrupted sync resumes where it
//! stopped, and a completed full sync lets later runs poll only for
//! records updated since.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │ RepairShopr  │──▶│ PagedFetch │──▶│  Document   │──▶│   Onyx   │
//! │ client + RL  │   │ dedup/since│   │  builder    │   │   sink   │
//! └──────────────┘   └─────┬──────┘   └──────▲──────┘   └──────────┘
//!                          │ observer        │ enrich
//!                          ▼                 │
//!                    ┌────────────┐          │
//!                    │ EntityCache│──────────┘
//!                    │  LRU + TTL │
//!                    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rs-onyx init                  # write ./config/rs-onyx.toml
//! rs-onyx test                  # check the API key
//! rs-onyx sync                  # full or poll, decided from the checkpoint
//! rs-onyx status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Library error type |
//! | [`models`] | RepairShopr record types and entity kinds |
//! | [`rate_limiter`] | Token bucket shared by API requests |
//! | [`cache`] | Bounded LRU + TTL caches for enrichment |
//! | [`checkpoint`] | Crash-safe sync state |
//! | [`source`] | RepairShopr API boundary and HTTP client |
//! | [`fetch`] | Paginated fetch with dedup and since filtering |
//! | [`document`] | Onyx document rendering |
//! | [`sink`] | Onyx delivery boundary |
//! | [`sync`] | Sync orchestration |
//! | [`progress`] | Progress reporting on stderr |
//! | [`status`] | `status` and `stats` summaries |
//! | [`logging`] | tracing subscriber setup |

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod models;
pub mod progress;
pub mod rate_limiter;
pub mod sink;
pub mod source;
pub mod status;
pub mod sync;
