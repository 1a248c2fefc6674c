//! Core data models for the deduplicating file store.
//!
//! `FileRecord` maps to the `files` table via `sqlx::FromRow` and serializes
//! as JSON via `serde`. `Digest` is the content address shared by records and
//! the physical objects they point at.

pub mod digest;
pub mod file_record;
