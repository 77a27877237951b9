//! Shared types, error model, and configuration for the lakehouse pipeline.
//!
//! This crate is the foundation depended on by all other lakehouse crates.
//! It provides:
//! - [`LakehouseError`], the unified error type
//! - Domain types ([`Record`], [`Batch`], [`QualityVerdict`], [`LineageEntry`], [`IndexDelta`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FingerprintRules, IndexSection, PipelineConfig, PipelineSection,
    QualityThresholds, StageNames, StorageSection, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{LakehouseError, Result};
pub use types::{
    ALTERNATE_SOURCES_KEY, Batch, GateFailure, IndexDelta, IndexDocument, LineageEntry, Metadata,
    QualityVerdict, Record, Rejection, RejectionReason, Stage, TransitionOutcome,
};
