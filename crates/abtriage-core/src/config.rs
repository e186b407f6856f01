//! Run configuration for the triage pipeline.
//!
//! One immutable `RunConfig` value is loaded (or defaulted) before the run
//! and passed explicitly through every call; there is no ambient mutable
//! state. Defaults encode the standard five-stage cascade:
//! binding-quality → humanness → sequence-liabilities → developability →
//! aggregation-propensity.

use crate::errors::{Result, TriageError};
use crate::metrics::{keys, ImportanceWeight};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Rejection semantics of a filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hardness {
    /// Failure rejects the candidate outright.
    Hard,
    /// Failure records a risk flag and continues.
    Soft,
}

/// When the fallback touches a stage's threshold.
///
/// `First`-priority stages are relaxed before any `Last`-priority stage, and
/// may be relaxed over the full default↔baseline gap. `Last`-priority stages
/// are only relaxed once the first phase falls short, and never past
/// `max_threshold_relaxation` of their gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxPriority {
    First,
    Last,
    /// Never relaxed by the fallback.
    Never,
}

/// Where a stage's threshold comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    /// Derived by the calibration engine for the stage's metric
    /// (default = min over controls − margin; gap to baseline = margin).
    Calibrated,
    /// Fixed at configuration time. `relaxation_gap` is the full
    /// default↔baseline distance the fallback may draw on.
    Fixed { value: f64, relaxation_gap: f64 },
}

/// Evaluation rule of a filter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRule {
    /// Candidate passes when `metric >= threshold`.
    MetricAtLeast {
        metric: String,
        threshold: ThresholdSource,
    },
    /// Candidate passes when `metric <= threshold`.
    MetricAtMost {
        metric: String,
        threshold: ThresholdSource,
    },
    /// Liability scoping: CDR occurrences above `max_cdr` fail the stage;
    /// framework occurrences are recorded informationally only.
    LiabilityScoped { max_cdr: usize },
}

impl StageRule {
    /// Metric this rule reads, if it reads one.
    pub fn metric(&self) -> Option<&str> {
        match self {
            StageRule::MetricAtLeast { metric, .. } | StageRule::MetricAtMost { metric, .. } => {
                Some(metric)
            }
            StageRule::LiabilityScoped { .. } => None,
        }
    }

    pub fn threshold_source(&self) -> Option<&ThresholdSource> {
        match self {
            StageRule::MetricAtLeast { threshold, .. }
            | StageRule::MetricAtMost { threshold, .. } => Some(threshold),
            StageRule::LiabilityScoped { .. } => None,
        }
    }
}

/// One configured filter stage. Stages run in list order and are immutable
/// for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub hardness: Hardness,
    pub relax_priority: RelaxPriority,
    pub rule: StageRule,
}

/// Fallback policy for when too few candidates survive the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Minimum surviving candidates before the fallback triggers.
    pub min_candidates: usize,
    /// Cap on `Last`-priority relaxation, as a fraction of each stage's
    /// default↔baseline gap.
    pub max_threshold_relaxation: f64,
    /// Number of equal increments each relaxation phase walks through.
    pub relaxation_steps: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            min_candidates: 10,
            max_threshold_relaxation: 0.10,
            relaxation_steps: 4,
        }
    }
}

/// Calibration inputs: margins and per-metric semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Safety margin subtracted from (or added to, for lower-is-better
    /// metrics) the worst control value, per metric.
    pub margins: BTreeMap<String, f64>,
    /// Valid-domain floor per metric; derived thresholds are clipped here
    /// (e.g. areas and counts never go negative).
    pub domain_floors: BTreeMap<String, f64>,
    /// Known-degenerate backend sentinel per metric. When every control
    /// reports exactly this value the metric is flagged unusable. This is
    /// deliberately explicit configuration, not an implicit "all zeros"
    /// rule.
    pub degenerate_sentinels: BTreeMap<String, f64>,
    /// Hard overrides of the derived `usable` flag.
    pub usable_overrides: BTreeMap<String, bool>,
}

/// Ranking weights and direction sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Importance weight (>= 1) per ranked metric.
    pub weights: BTreeMap<String, ImportanceWeight>,
    /// Metrics where a smaller value is better (e.g. interface PAE).
    pub lower_is_better: BTreeSet<String>,
    /// Tie-break metric; higher is better.
    pub primary_metric: String,
}

impl Default for RankingConfig {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        let w = |v: f64| ImportanceWeight::new(v).expect("static weight");
        weights.insert(keys::IPTM.to_string(), w(3.0));
        weights.insert(keys::PAE_INTERACTION.to_string(), w(3.0));
        weights.insert(keys::INTERFACE_AREA.to_string(), w(2.0));
        weights.insert(keys::PLDDT.to_string(), w(2.0));
        weights.insert(keys::HUMANNESS.to_string(), w(1.5));
        weights.insert(keys::CONTACT_COUNT.to_string(), w(1.0));

        let mut lower_is_better = BTreeSet::new();
        lower_is_better.insert(keys::PAE_INTERACTION.to_string());
        lower_is_better.insert(keys::AGGREGATION.to_string());

        Self {
            weights,
            lower_is_better,
            primary_metric: keys::IPTM.to_string(),
        }
    }
}

/// Diversity trade-off for greedy selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiversityConfig {
    /// Weight of dissimilarity against quality, in [0, 1]. Intentionally
    /// small so quality dominates except among near-duplicates.
    pub alpha: f64,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self { alpha: 0.15 }
    }
}

/// Canonical reference used for epitope overlap classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpitopeConfig {
    /// Canonical reference sequence, one-letter amino acid codes.
    pub reference_seq: String,
    /// Original residue number per reference position; may start at an
    /// offset, skip residues, or cover fused segments.
    pub reference_numbering: Vec<i32>,
    /// Known epitope residues, in the reference's original numbering.
    pub epitope_positions: Vec<i32>,
    /// Marks a fusion/non-canonical reference construct; such a reference
    /// is corroborating-only and its calls are downgraded to risk flags.
    pub fusion_construct: bool,
    /// Minimum overlap fraction for a known-like call.
    pub overlap_threshold: f64,
}

/// Worker pool and external-call budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bounded worker pool size for calibration and enrichment fan-out.
    pub workers: usize,
    /// Attempts per external call (1 = no retry).
    pub retry_attempts: usize,
    /// Per-call deadline handed to collaborators, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_attempts: 3,
            call_timeout_secs: 600,
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub calibration: CalibrationConfig,
    pub stages: Vec<StageConfig>,
    pub fallback: FallbackConfig,
    pub ranking: RankingConfig,
    pub diversity: DiversityConfig,
    pub epitope: Option<EpitopeConfig>,
    pub runtime: RuntimeConfig,
    /// Size of the final selected set.
    pub select_n: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut calibration = CalibrationConfig::default();
        calibration.margins.insert(keys::INTERFACE_AREA.to_string(), 100.0);
        calibration.margins.insert(keys::IPTM.to_string(), 0.05);
        calibration.margins.insert(keys::PAE_INTERACTION.to_string(), 1.0);
        calibration.margins.insert(keys::CONTACT_COUNT.to_string(), 5.0);
        calibration.domain_floors.insert(keys::INTERFACE_AREA.to_string(), 0.0);
        calibration.domain_floors.insert(keys::CONTACT_COUNT.to_string(), 0.0);
        calibration.domain_floors.insert(keys::IPTM.to_string(), 0.0);
        // Some prediction backends emit contact_count as a constant zero.
        calibration
            .degenerate_sentinels
            .insert(keys::CONTACT_COUNT.to_string(), 0.0);

        let stages = vec![
            StageConfig {
                name: "binding-quality".to_string(),
                hardness: Hardness::Hard,
                relax_priority: RelaxPriority::Last,
                rule: StageRule::MetricAtLeast {
                    metric: keys::INTERFACE_AREA.to_string(),
                    threshold: ThresholdSource::Calibrated,
                },
            },
            StageConfig {
                name: "humanness".to_string(),
                hardness: Hardness::Hard,
                relax_priority: RelaxPriority::First,
                rule: StageRule::MetricAtLeast {
                    metric: keys::HUMANNESS.to_string(),
                    threshold: ThresholdSource::Fixed {
                        value: 0.80,
                        relaxation_gap: 0.10,
                    },
                },
            },
            StageConfig {
                name: "sequence-liabilities".to_string(),
                hardness: Hardness::Hard,
                relax_priority: RelaxPriority::Never,
                rule: StageRule::LiabilityScoped { max_cdr: 0 },
            },
            StageConfig {
                name: "developability".to_string(),
                hardness: Hardness::Soft,
                relax_priority: RelaxPriority::First,
                rule: StageRule::MetricAtLeast {
                    metric: keys::DEVELOPABILITY.to_string(),
                    threshold: ThresholdSource::Fixed {
                        value: 0.50,
                        relaxation_gap: 0.20,
                    },
                },
            },
            StageConfig {
                name: "aggregation-propensity".to_string(),
                hardness: Hardness::Soft,
                relax_priority: RelaxPriority::First,
                rule: StageRule::MetricAtMost {
                    metric: keys::AGGREGATION.to_string(),
                    threshold: ThresholdSource::Fixed {
                        value: 0.60,
                        relaxation_gap: 0.20,
                    },
                },
            },
        ];

        Self {
            calibration,
            stages,
            fallback: FallbackConfig::default(),
            ranking: RankingConfig::default(),
            diversity: DiversityConfig::default(),
            epitope: None,
            runtime: RuntimeConfig::default(),
            select_n: 10,
        }
    }
}

impl RunConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints up front so the pipeline never has
    /// to re-check them mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(TriageError::config("at least one filter stage is required"));
        }
        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(TriageError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if let Some(ThresholdSource::Fixed { relaxation_gap, .. }) =
                stage.rule.threshold_source()
            {
                if *relaxation_gap < 0.0 {
                    return Err(TriageError::config(format!(
                        "stage '{}': relaxation_gap must be non-negative",
                        stage.name
                    )));
                }
            }
            if let (Some(metric), Some(ThresholdSource::Calibrated)) =
                (stage.rule.metric(), stage.rule.threshold_source())
            {
                if !self.calibration.margins.contains_key(metric) {
                    return Err(TriageError::config(format!(
                        "stage '{}' calibrates metric '{}' but no margin is configured",
                        stage.name, metric
                    )));
                }
            }
        }

        let f = &self.fallback;
        if !(0.0..=1.0).contains(&f.max_threshold_relaxation) {
            return Err(TriageError::config(
                "max_threshold_relaxation must be within [0, 1]",
            ));
        }
        if f.relaxation_steps == 0 {
            return Err(TriageError::config("relaxation_steps must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.diversity.alpha) {
            return Err(TriageError::config("diversity alpha must be within [0, 1]"));
        }
        if !self.ranking.weights.contains_key(&self.ranking.primary_metric) {
            return Err(TriageError::config(format!(
                "primary metric '{}' has no importance weight",
                self.ranking.primary_metric
            )));
        }

        if let Some(ep) = &self.epitope {
            if ep.reference_seq.len() != ep.reference_numbering.len() {
                return Err(TriageError::config(
                    "epitope reference sequence and numbering lengths differ",
                ));
            }
            if !(0.0..=1.0).contains(&ep.overlap_threshold) {
                return Err(TriageError::config(
                    "epitope overlap_threshold must be within [0, 1]",
                ));
            }
        }

        if self.runtime.workers == 0 {
            return Err(TriageError::config("workers must be at least 1"));
        }
        if self.runtime.retry_attempts == 0 {
            return Err(TriageError::config("retry_attempts must be at least 1"));
        }
        if self.select_n == 0 {
            return Err(TriageError::config("select_n must be at least 1"));
        }

        Ok(())
    }
}
