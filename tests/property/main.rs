//! Property-based soundness tests.
//!
//! Run with: `cargo test --test property`

mod dedup_soundness;
mod partition_soundness;
