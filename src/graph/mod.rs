//! Remote API layer: one resilient HTTP client plus thin adapters for the
//! to-do, notes and calendar endpoints.

pub mod auth;
pub mod calendar;
pub mod client;
pub mod notes;
pub mod todo;

pub use auth::{FileTokens, StaticTokens, TokenProvider};
pub use calendar::CalendarApi;
pub use client::{GraphClient, RetryPolicy};
pub use notes::NotesApi;
pub use todo::TodoApi;
