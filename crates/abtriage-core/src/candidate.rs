//! Candidate data model.
//!
//! A `Candidate` is created once structural and sequence metrics are
//! available from the external collaborators, mutated only by the filter
//! cascade (stage outcomes, risk flags) and the ranking engine (rank
//! report), and frozen after selection. Each candidate is owned exclusively
//! by the pipeline run that created it.

use crate::metrics::MetricSet;
use serde::{Deserialize, Serialize};

/// Where a candidate sequence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTrack {
    /// De novo generated by the design model.
    Generated,
    /// Derived by optimizing a known binder.
    OptimizedFromKnown,
}

/// Binder chain sequences: single-domain or paired heavy/light.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinderChains {
    /// Primary chain; used for pairwise identity in diversity selection.
    pub primary: String,
    /// Second chain for paired formats, `None` for single-domain binders.
    pub secondary: Option<String>,
}

impl BinderChains {
    pub fn single(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
        }
    }

    pub fn paired(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: Some(secondary.into()),
        }
    }
}

/// Epitope classification relative to the canonical reference epitope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpitopeClass {
    /// Overlap fraction reached the configured threshold.
    KnownLike,
    /// Alignment succeeded but overlap stayed below the threshold.
    Novel,
    /// Alignment failed to map any epitope residue; never guessed.
    Unknown,
}

/// Epitope overlap result attached to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpitopeCall {
    pub class: EpitopeClass,
    /// Fraction of the mapped reference epitope recovered among contacts.
    pub overlap: f64,
    /// Canonical epitope residue numbers that landed on alignment gaps.
    pub dropped_positions: Vec<i32>,
}

impl EpitopeCall {
    /// Call used before classification ran, or when it could not run.
    pub fn unknown() -> Self {
        Self {
            class: EpitopeClass::Unknown,
            overlap: 0.0,
            dropped_positions: Vec::new(),
        }
    }
}

/// One liability motif occurrence found by upstream sequence scanning,
/// not yet scoped to a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiabilitySite {
    /// Motif name, e.g. "NG deamidation".
    pub motif: String,
    /// 0-indexed start position in the primary chain.
    pub position: usize,
}

/// Sequence-liability occurrences, scoped by region.
///
/// Scanning itself happens upstream; the cascade only needs the counts and
/// the region split (CDR occurrences gate hard, framework occurrences are
/// informational). Enrichment produces this from the candidate's raw
/// `liability_sites` and the numbering collaborator's region map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiabilitySummary {
    /// Liability motifs falling inside a CDR.
    pub cdr_count: usize,
    /// Liability motifs falling inside framework regions.
    pub framework_count: usize,
    /// Motif names for the report, e.g. "NG deamidation".
    pub motifs: Vec<String>,
}

/// Outcome of one filter stage for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageVerdict {
    Passed,
    Failed,
    /// Required metric absent or flagged unusable; counted as a soft pass.
    Skipped,
}

/// Per-stage record kept on the candidate for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub verdict: StageVerdict,
    /// Threshold in effect when the stage ran (post-relaxation if any).
    pub threshold: Option<f64>,
    /// Observed metric value, when present.
    pub observed: Option<f64>,
}

/// Aggregate accept/reject status after the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Not yet filtered.
    Pending,
    Accepted,
    /// Accepted, but only under relaxed thresholds.
    AcceptedWithRelaxation,
    Rejected,
}

/// Whether enrichment completed for this candidate.
///
/// A cancelled batch leaves candidates explicitly `Unscored`; their missing
/// metrics then soft-skip every stage that requires them instead of
/// defaulting to pass or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringState {
    Scored,
    Unscored,
}

/// Rank components attached by the ranking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankReport {
    /// Final 1-indexed position in the selected list.
    pub position: usize,
    /// Worst weighted rank across available metrics (the quality key).
    pub quality_key: f64,
    /// Quality key normalized to [0, 1] across the accepted pool.
    pub quality_norm: f64,
    /// Per-metric integer ranks that fed the quality key.
    pub metric_ranks: Vec<(String, usize)>,
}

/// One binder candidate flowing through the triage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub track: SourceTrack,
    pub chains: BinderChains,
    /// Predicted target-chain sequence from the structure model, used for
    /// epitope alignment. Absent until enrichment runs.
    pub predicted_target_seq: Option<String>,
    /// Predicted binder/target contact residues, 1-indexed in the predicted
    /// structure's own gap-free numbering.
    pub contact_positions: Vec<usize>,
    pub metrics: MetricSet,
    /// Raw liability occurrences awaiting CDR/framework scoping.
    pub liability_sites: Vec<LiabilitySite>,
    pub liabilities: LiabilitySummary,
    pub epitope: EpitopeCall,
    pub stage_outcomes: Vec<StageOutcome>,
    pub status: AggregateStatus,
    pub risk_flags: Vec<String>,
    pub scoring: ScoringState,
    pub rank: Option<RankReport>,
}

impl Candidate {
    /// Fresh candidate awaiting enrichment.
    pub fn new(id: impl Into<String>, track: SourceTrack, chains: BinderChains) -> Self {
        Self {
            id: id.into(),
            track,
            chains,
            predicted_target_seq: None,
            contact_positions: Vec::new(),
            metrics: MetricSet::new(),
            liability_sites: Vec::new(),
            liabilities: LiabilitySummary::default(),
            epitope: EpitopeCall::unknown(),
            stage_outcomes: Vec::new(),
            status: AggregateStatus::Pending,
            risk_flags: Vec::new(),
            scoring: ScoringState::Unscored,
            rank: None,
        }
    }

    /// Append a risk flag, deduplicated.
    pub fn flag(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        if !self.risk_flags.contains(&flag) {
            self.risk_flags.push(flag);
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self.status,
            AggregateStatus::Accepted | AggregateStatus::AcceptedWithRelaxation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_candidate_is_pending_unscored() {
        let c = Candidate::new("cand-001", SourceTrack::Generated, BinderChains::single("EVQLVESGG"));
        assert_eq!(c.status, AggregateStatus::Pending);
        assert_eq!(c.scoring, ScoringState::Unscored);
        assert_eq!(c.epitope.class, EpitopeClass::Unknown);
        assert!(!c.is_accepted());
    }

    #[test]
    fn test_flag_dedup() {
        let mut c = Candidate::new("cand-002", SourceTrack::OptimizedFromKnown, BinderChains::single("QVQ"));
        c.flag("humanness_below_threshold");
        c.flag("humanness_below_threshold");
        assert_eq!(c.risk_flags.len(), 1);
    }

    #[test]
    fn test_accepted_variants() {
        let mut c = Candidate::new("cand-003", SourceTrack::Generated, BinderChains::single("QVQ"));
        c.status = AggregateStatus::AcceptedWithRelaxation;
        assert!(c.is_accepted());
        c.status = AggregateStatus::Rejected;
        assert!(!c.is_accepted());
    }
}
