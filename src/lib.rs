//! Taskmirror: reconciles remote to-do lists against a durable local
//! snapshot and keeps their derived notes and calendar events in step.
//!
//! Each sync cycle follows one shape:
//! To Do lists → diff against the store → dispatch actions → weekly review
//!
//! # Architecture
//!
//! The cycle is built from narrow, separately testable pieces:
//! - **graph**: resilient Microsoft Graph client (retry with backoff,
//!   throttle compliance, reauthentication, pagination) plus the To Do,
//!   OneNote and Calendar surfaces
//! - **classify**: pure keyword scoring that decides which tasks deserve
//!   a note artifact
//! - **store**: cached task records, the append-only audit log and the
//!   weekly-review markers, on SQLite or an Azure table
//! - **engine**: the fetch → diff → act → persist orchestrator

pub mod classify;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod remote;
pub mod store;

pub use classify::Classifier;
pub use clock::{Clock, SystemClock};
pub use config::SyncConfig;
pub use engine::{CycleReport, SyncEngine};
pub use error::{Result, SyncError};
pub use store::{StateStore, open_store};
