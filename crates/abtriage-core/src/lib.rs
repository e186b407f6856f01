//! ABTRIAGE core types
//!
//! Shared domain model for the binder candidate triage pipeline: the
//! candidate record, optional-metric model, run configuration, and the
//! unified error type. The algorithms live in `abtriage-select`; this crate
//! stays dependency-light so every member can build on it.

pub mod candidate;
pub mod config;
pub mod errors;
pub mod metrics;

pub use candidate::{
    AggregateStatus, BinderChains, Candidate, EpitopeCall, EpitopeClass, LiabilitySite,
    LiabilitySummary, RankReport, ScoringState, SourceTrack, StageOutcome, StageVerdict,
};
pub use config::{
    CalibrationConfig, DiversityConfig, EpitopeConfig, FallbackConfig, Hardness, RankingConfig,
    RelaxPriority, RunConfig, RuntimeConfig, StageConfig, StageRule, ThresholdSource,
};
pub use errors::{Result, TriageError};
pub use metrics::{keys, ImportanceWeight, MetricSet, MetricValue};
