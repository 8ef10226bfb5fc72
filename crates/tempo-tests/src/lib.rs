//! Integration tests for the Tempo archive pipeline live in `tests/`.
//!
//! This crate intentionally has no library code of its own.
