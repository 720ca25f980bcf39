//! Deterministic, pure logic shared by the arena engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod flavor;
pub mod job;
pub mod repo_key;
pub mod rules;
