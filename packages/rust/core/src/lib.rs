//! Pipeline orchestration for the lakehouse.
//!
//! This crate ties the pure transforms, the storage layer and the vector
//! index together into end-to-end workflows: landing RAW batches
//! ([`ingest`]), promoting them through the stages ([`pipeline`]) and
//! pushing the curated layer into the index ([`sync`]).

pub mod dedup;
pub mod ingest;
pub mod pipeline;
pub mod quality;
pub mod sync;
