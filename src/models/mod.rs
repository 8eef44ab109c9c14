//! Core data models for the chunked recorder.
//!
//! Row types map onto the two local tables (`chunks`, `upload_sessions`)
//! via `sqlx::FromRow`; wire types mirror the JSON exchanged with the
//! upload broker.

pub mod chunk;
pub mod part;
pub mod session;
