//! ABTRIAGE selection engine
//!
//! Picks a small, diverse set of high-quality binder candidates out of a
//! large prediction pool. Four cooperating parts, in dependency order:
//!
//! 1. **Calibration**: thresholds derived from known-positive controls
//!    (worst control value minus a safety margin), so every known binder
//!    passes by construction.
//! 2. **Epitope alignment**: contacts in predicted numbering mapped onto a
//!    canonical reference numbering by global sequence alignment, yielding
//!    an overlap fraction and known-like/novel/unknown call.
//! 3. **Filter cascade**: ordered hard/soft stages with a stepwise
//!    threshold-relaxation fallback and full audit bookkeeping.
//! 4. **Ranking**: worst-weighted-rank quality keys and greedy maximin
//!    diversity selection.
//!
//! External predictive services (structure prediction, antibody numbering,
//! humanness scoring) enter through the traits in [`collaborators`].

pub mod calibration;
pub mod cascade;
pub mod collaborators;
pub mod enrichment;
pub mod epitope;
pub mod pipeline;
pub mod ranking;

pub use calibration::{
    CalibratedThreshold, CalibrationEngine, CalibrationResult, Control, ThresholdDirection,
};
pub use cascade::{CascadeOutcome, FilterCascade, RelaxationRecord, StageRelaxation};
pub use collaborators::{
    HumannessService, NumberingService, PrecomputedHumanness, PrecomputedNumbering,
    PrecomputedPredictions, PredictionService, RegionMap, RetryPolicy,
};
pub use enrichment::Enricher;
pub use epitope::{global_align, sequence_identity, CanonicalReference, EpitopeAligner};
pub use pipeline::{Collaborators, RunReport, TriageRunner};
pub use ranking::RankingEngine;
