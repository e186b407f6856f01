//! Multi-stage pass/fail filter cascade with threshold relaxation fallback.
//!
//! Stages run in their configured order for every candidate. A hard-stage
//! failure rejects the candidate outright; a soft-stage failure appends a
//! risk flag and continues. A stage whose required metric is absent is
//! soft-skipped for that candidate only (logged, never an error), and a
//! metric flagged unusable by calibration is never gated on at all.
//!
//! When fewer than `min_candidates` survive, the fallback relaxes
//! thresholds: `First`-priority stages stepwise over their full
//! default↔baseline gap, then `Last`-priority stages stepwise up to
//! `max_threshold_relaxation` of theirs. Every candidate admitted only under
//! relaxation is tagged, and the exact per-stage amounts are recorded for
//! audit. If the cap is exhausted before the minimum is reached, the run
//! fails rather than silently returning a short list.

use crate::calibration::{CalibrationResult, ThresholdDirection};
use abtriage_core::candidate::{AggregateStatus, Candidate, StageOutcome, StageVerdict};
use abtriage_core::config::{
    FallbackConfig, Hardness, RelaxPriority, StageConfig, StageRule, ThresholdSource,
};
use abtriage_core::errors::{Result, TriageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One relaxed stage in the audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRelaxation {
    pub stage: String,
    /// Fraction of the stage's default↔baseline gap that was applied.
    pub fraction: f64,
    /// Absolute threshold movement.
    pub amount: f64,
    pub original_threshold: f64,
    pub relaxed_threshold: f64,
}

/// Audit record produced whenever the fallback relaxed anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelaxationRecord {
    pub relaxed_stages: Vec<StageRelaxation>,
    /// Candidates accepted only because thresholds were relaxed.
    pub admitted_by_relaxation: Vec<String>,
}

/// Cascade output: annotated candidates plus the relaxation audit record.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub accepted: Vec<Candidate>,
    pub rejected: Vec<Candidate>,
    pub relaxation: Option<RelaxationRecord>,
}

/// A stage threshold resolved against calibration, before any relaxation.
#[derive(Debug, Clone, Copy)]
struct ResolvedThreshold {
    value: f64,
    /// Full default↔baseline gap available to the fallback.
    gap: f64,
    direction: ThresholdDirection,
    usable: bool,
}

/// Pass/fail labels of a single evaluation sweep.
struct SweepResult {
    /// Per candidate: stage outcomes, risk flags, accepted.
    outcomes: Vec<(Vec<StageOutcome>, Vec<String>, bool)>,
    accepted_count: usize,
}

pub struct FilterCascade<'a> {
    stages: &'a [StageConfig],
    calibration: &'a CalibrationResult,
    fallback: &'a FallbackConfig,
}

impl<'a> FilterCascade<'a> {
    pub fn new(
        stages: &'a [StageConfig],
        calibration: &'a CalibrationResult,
        fallback: &'a FallbackConfig,
    ) -> Self {
        Self {
            stages,
            calibration,
            fallback,
        }
    }

    /// Run the cascade, relaxing thresholds if too few candidates survive.
    ///
    /// Pure in its inputs: re-running on an unchanged pool with unchanged
    /// thresholds yields identical labels.
    pub fn apply(&self, candidates: Vec<Candidate>) -> Result<CascadeOutcome> {
        let resolved = self.resolve_thresholds()?;

        // No relaxation: the common path.
        let mut fractions: BTreeMap<String, f64> = BTreeMap::new();
        let baseline_sweep = self.sweep(&candidates, &resolved, &fractions);
        let baseline_accepted: Vec<bool> = baseline_sweep
            .outcomes
            .iter()
            .map(|(_, _, ok)| *ok)
            .collect();

        let mut final_sweep = baseline_sweep;
        if final_sweep.accepted_count < self.fallback.min_candidates {
            log::warn!(
                "only {}/{} candidates passed; starting threshold relaxation",
                final_sweep.accepted_count,
                self.fallback.min_candidates
            );
            final_sweep = self.relax(&candidates, &resolved, &mut fractions, final_sweep);
        }

        if final_sweep.accepted_count < self.fallback.min_candidates {
            return Err(TriageError::InsufficientCandidates {
                needed: self.fallback.min_candidates,
                got: final_sweep.accepted_count,
            });
        }

        let relaxation = self.build_record(&resolved, &fractions, &candidates, &baseline_accepted, &final_sweep);

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (mut candidate, (outcomes, flags, ok)) in
            candidates.into_iter().zip(final_sweep.outcomes)
        {
            candidate.stage_outcomes = outcomes;
            for flag in flags {
                candidate.flag(flag);
            }
            if ok {
                let relaxed_only = relaxation
                    .as_ref()
                    .map_or(false, |r| r.admitted_by_relaxation.contains(&candidate.id));
                candidate.status = if relaxed_only {
                    candidate.flag("relaxed");
                    AggregateStatus::AcceptedWithRelaxation
                } else {
                    AggregateStatus::Accepted
                };
                accepted.push(candidate);
            } else {
                candidate.status = AggregateStatus::Rejected;
                rejected.push(candidate);
            }
        }

        Ok(CascadeOutcome {
            accepted,
            rejected,
            relaxation,
        })
    }

    /// Resolve every metric stage's default threshold and relaxation gap.
    fn resolve_thresholds(&self) -> Result<BTreeMap<String, ResolvedThreshold>> {
        let mut resolved = BTreeMap::new();
        for stage in self.stages {
            let (metric, source) = match (stage.rule.metric(), stage.rule.threshold_source()) {
                (Some(m), Some(s)) => (m, s),
                _ => continue,
            };
            let direction = match &stage.rule {
                StageRule::MetricAtMost { .. } => ThresholdDirection::AtMost,
                _ => ThresholdDirection::AtLeast,
            };
            let entry = match source {
                ThresholdSource::Calibrated => {
                    let t = self.calibration.threshold(metric).ok_or_else(|| {
                        TriageError::calibration(
                            "<cascade>",
                            format!(
                                "stage '{}' requires calibrated metric '{metric}'",
                                stage.name
                            ),
                        )
                    })?;
                    ResolvedThreshold {
                        value: t.threshold,
                        gap: t.margin,
                        direction,
                        usable: t.usable,
                    }
                }
                ThresholdSource::Fixed {
                    value,
                    relaxation_gap,
                } => ResolvedThreshold {
                    value: *value,
                    gap: *relaxation_gap,
                    direction,
                    usable: self.calibration.usable(metric),
                },
            };
            resolved.insert(stage.name.clone(), entry);
        }
        Ok(resolved)
    }

    /// Threshold in effect for a stage under the given relaxation fraction.
    fn effective_threshold(resolved: &ResolvedThreshold, fraction: f64) -> f64 {
        match resolved.direction {
            ThresholdDirection::AtLeast => resolved.value - fraction * resolved.gap,
            ThresholdDirection::AtMost => resolved.value + fraction * resolved.gap,
        }
    }

    /// Evaluate every candidate against every stage under the given
    /// relaxation fractions. Pure; owns all pass/fail semantics.
    fn sweep(
        &self,
        candidates: &[Candidate],
        resolved: &BTreeMap<String, ResolvedThreshold>,
        fractions: &BTreeMap<String, f64>,
    ) -> SweepResult {
        let mut outcomes = Vec::with_capacity(candidates.len());
        let mut accepted_count = 0;

        for candidate in candidates {
            let mut stage_outcomes = Vec::with_capacity(self.stages.len());
            let mut flags = Vec::new();
            let mut hard_failed = false;

            for stage in self.stages {
                let outcome = match &stage.rule {
                    StageRule::LiabilityScoped { max_cdr } => {
                        self.evaluate_liabilities(stage, *max_cdr, candidate, &mut flags)
                    }
                    StageRule::MetricAtLeast { metric, .. }
                    | StageRule::MetricAtMost { metric, .. } => {
                        let r = &resolved[&stage.name];
                        let fraction = fractions.get(&stage.name).copied().unwrap_or(0.0);
                        let threshold = Self::effective_threshold(r, fraction);
                        self.evaluate_metric(stage, metric, r, threshold, candidate, &mut flags)
                    }
                };
                if outcome.verdict == StageVerdict::Failed && stage.hardness == Hardness::Hard {
                    hard_failed = true;
                }
                stage_outcomes.push(outcome);
            }

            let ok = !hard_failed;
            if ok {
                accepted_count += 1;
            }
            outcomes.push((stage_outcomes, flags, ok));
        }

        SweepResult {
            outcomes,
            accepted_count,
        }
    }

    fn evaluate_metric(
        &self,
        stage: &StageConfig,
        metric: &str,
        resolved: &ResolvedThreshold,
        threshold: f64,
        candidate: &Candidate,
        flags: &mut Vec<String>,
    ) -> StageOutcome {
        // An unusable metric carries no information; gating on it would
        // accept or reject on noise.
        if !resolved.usable {
            return StageOutcome {
                stage: stage.name.clone(),
                verdict: StageVerdict::Skipped,
                threshold: Some(threshold),
                observed: candidate.metrics.get(metric),
            };
        }

        let observed = match candidate.metrics.get(metric) {
            Some(v) => v,
            None => {
                // Missing-metric warning: soft skip for this candidate only.
                log::debug!(
                    "candidate '{}': metric '{metric}' absent, skipping stage '{}'",
                    candidate.id,
                    stage.name
                );
                return StageOutcome {
                    stage: stage.name.clone(),
                    verdict: StageVerdict::Skipped,
                    threshold: Some(threshold),
                    observed: None,
                };
            }
        };

        let passed = match resolved.direction {
            ThresholdDirection::AtLeast => observed >= threshold,
            ThresholdDirection::AtMost => observed <= threshold,
        };

        if !passed && stage.hardness == Hardness::Soft {
            flags.push(format!("{}_below_threshold", stage.name));
        }

        StageOutcome {
            stage: stage.name.clone(),
            verdict: if passed {
                StageVerdict::Passed
            } else {
                StageVerdict::Failed
            },
            threshold: Some(threshold),
            observed: Some(observed),
        }
    }

    fn evaluate_liabilities(
        &self,
        stage: &StageConfig,
        max_cdr: usize,
        candidate: &Candidate,
        flags: &mut Vec<String>,
    ) -> StageOutcome {
        // Framework occurrences are informational regardless of hardness.
        if candidate.liabilities.framework_count > 0 {
            flags.push(format!(
                "framework_liabilities:{}",
                candidate.liabilities.framework_count
            ));
        }

        let passed = candidate.liabilities.cdr_count <= max_cdr;
        if !passed && stage.hardness == Hardness::Soft {
            flags.push(format!("{}_cdr_liabilities", stage.name));
        }

        StageOutcome {
            stage: stage.name.clone(),
            verdict: if passed {
                StageVerdict::Passed
            } else {
                StageVerdict::Failed
            },
            threshold: Some(max_cdr as f64),
            observed: Some(candidate.liabilities.cdr_count as f64),
        }
    }

    /// Two-phase relaxation ladder. Mutates `fractions` in place; the last
    /// sweep performed is returned and is the one in effect.
    fn relax(
        &self,
        candidates: &[Candidate],
        resolved: &BTreeMap<String, ResolvedThreshold>,
        fractions: &mut BTreeMap<String, f64>,
        mut sweep: SweepResult,
    ) -> SweepResult {
        let steps = self.fallback.relaxation_steps;
        let phases = [
            (RelaxPriority::First, 1.0),
            (RelaxPriority::Last, self.fallback.max_threshold_relaxation),
        ];

        for (priority, cap) in phases {
            if cap <= 0.0 {
                continue;
            }
            // Fixed priority order = configured stage order within a phase.
            for stage in self.stages.iter().filter(|s| s.relax_priority == priority) {
                if !resolved.contains_key(&stage.name) {
                    continue;
                }
                for step in 1..=steps {
                    if sweep.accepted_count >= self.fallback.min_candidates {
                        return sweep;
                    }
                    let fraction = cap * step as f64 / steps as f64;
                    fractions.insert(stage.name.clone(), fraction);
                    log::info!(
                        "relaxing stage '{}' to {:.1}% of its gap",
                        stage.name,
                        fraction * 100.0
                    );
                    sweep = self.sweep(candidates, resolved, fractions);
                }
            }
            if sweep.accepted_count >= self.fallback.min_candidates {
                return sweep;
            }
        }
        sweep
    }

    /// Assemble the audit record: which stages moved, and which candidates
    /// are only in because they did.
    fn build_record(
        &self,
        resolved: &BTreeMap<String, ResolvedThreshold>,
        fractions: &BTreeMap<String, f64>,
        candidates: &[Candidate],
        baseline_accepted: &[bool],
        final_sweep: &SweepResult,
    ) -> Option<RelaxationRecord> {
        let relaxed_stages: Vec<StageRelaxation> = fractions
            .iter()
            .filter(|(_, f)| **f > 0.0)
            .map(|(name, &fraction)| {
                let r = &resolved[name];
                let relaxed = Self::effective_threshold(r, fraction);
                StageRelaxation {
                    stage: name.clone(),
                    fraction,
                    amount: (relaxed - r.value).abs(),
                    original_threshold: r.value,
                    relaxed_threshold: relaxed,
                }
            })
            .collect();

        if relaxed_stages.is_empty() {
            return None;
        }

        let admitted_by_relaxation: Vec<String> = candidates
            .iter()
            .zip(baseline_accepted)
            .zip(final_sweep.outcomes.iter().map(|(_, _, ok)| ok))
            .filter(|((_, was), now)| !*was && **now)
            .map(|((c, _), _)| c.id.clone())
            .collect();

        Some(RelaxationRecord {
            relaxed_stages,
            admitted_by_relaxation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibratedThreshold;
    use abtriage_core::candidate::{BinderChains, SourceTrack};
    use abtriage_core::config::RunConfig;
    use abtriage_core::metrics::keys;

    fn calibration_with(metric: &str, threshold: f64, margin: f64, usable: bool) -> CalibrationResult {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            metric.to_string(),
            CalibratedThreshold {
                metric: metric.to_string(),
                direction: ThresholdDirection::AtLeast,
                threshold,
                baseline: threshold + margin,
                margin,
                usable,
            },
        );
        CalibrationResult {
            controls: BTreeMap::new(),
            thresholds,
        }
    }

    fn candidate(id: &str, area: Option<f64>) -> Candidate {
        let mut c = Candidate::new(id, SourceTrack::Generated, BinderChains::single("EVQLV"));
        if let Some(a) = area {
            c.metrics.set(keys::INTERFACE_AREA, a);
        }
        c
    }

    fn binding_stage() -> StageConfig {
        StageConfig {
            name: "binding-quality".to_string(),
            hardness: Hardness::Hard,
            relax_priority: RelaxPriority::Last,
            rule: StageRule::MetricAtLeast {
                metric: keys::INTERFACE_AREA.to_string(),
                threshold: ThresholdSource::Calibrated,
            },
        }
    }

    #[test]
    fn test_threshold_edge_pass_fail() {
        // Calibrated threshold 2060: 2059 fails, 2061 passes.
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let outcome = cascade
            .apply(vec![candidate("fail", Some(2059.0)), candidate("pass", Some(2061.0))])
            .unwrap();

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].id, "pass");
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].status, AggregateStatus::Rejected);
        assert!(outcome.relaxation.is_none());
    }

    #[test]
    fn test_absent_metric_soft_skips_but_zero_evaluates() {
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let outcome = cascade
            .apply(vec![candidate("absent", None), candidate("zero", Some(0.0))])
            .unwrap();

        // Absent metric: stage skipped, candidate survives.
        let absent = outcome.accepted.iter().find(|c| c.id == "absent").unwrap();
        assert_eq!(absent.stage_outcomes[0].verdict, StageVerdict::Skipped);

        // Present zero is evaluated normally and fails.
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].id, "zero");
        assert_eq!(outcome.rejected[0].stage_outcomes[0].verdict, StageVerdict::Failed);
    }

    #[test]
    fn test_unusable_metric_never_hard_gates() {
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, false);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let outcome = cascade.apply(vec![candidate("low", Some(1.0))]).unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].stage_outcomes[0].verdict, StageVerdict::Skipped);
    }

    #[test]
    fn test_soft_failure_flags_without_rejecting() {
        let calibration = CalibrationResult {
            controls: BTreeMap::new(),
            thresholds: BTreeMap::new(),
        };
        let stages = vec![StageConfig {
            name: "developability".to_string(),
            hardness: Hardness::Soft,
            relax_priority: RelaxPriority::Never,
            rule: StageRule::MetricAtLeast {
                metric: keys::DEVELOPABILITY.to_string(),
                threshold: ThresholdSource::Fixed {
                    value: 0.5,
                    relaxation_gap: 0.2,
                },
            },
        }];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let mut c = candidate("soft-fail", None);
        c.metrics.set(keys::DEVELOPABILITY, 0.3);
        let outcome = cascade.apply(vec![c]).unwrap();

        assert_eq!(outcome.accepted.len(), 1);
        let accepted = &outcome.accepted[0];
        assert_eq!(accepted.status, AggregateStatus::Accepted);
        assert!(accepted
            .risk_flags
            .iter()
            .any(|f| f == "developability_below_threshold"));
    }

    #[test]
    fn test_liability_scoping() {
        let calibration = CalibrationResult {
            controls: BTreeMap::new(),
            thresholds: BTreeMap::new(),
        };
        let stages = vec![StageConfig {
            name: "sequence-liabilities".to_string(),
            hardness: Hardness::Hard,
            relax_priority: RelaxPriority::Never,
            rule: StageRule::LiabilityScoped { max_cdr: 0 },
        }];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let mut cdr_hit = candidate("cdr", None);
        cdr_hit.liabilities.cdr_count = 1;
        let mut fw_hit = candidate("framework", None);
        fw_hit.liabilities.framework_count = 2;

        let outcome = cascade.apply(vec![cdr_hit, fw_hit]).unwrap();

        // CDR occurrence is hard; framework occurrence is informational.
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].id, "cdr");
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.accepted[0]
            .risk_flags
            .iter()
            .any(|f| f == "framework_liabilities:2"));
    }

    #[test]
    fn test_cascade_idempotent() {
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 1,
            ..FallbackConfig::default()
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let pool = vec![
            candidate("a", Some(2100.0)),
            candidate("b", Some(2059.0)),
            candidate("c", None),
        ];
        let first = cascade.apply(pool.clone()).unwrap();
        let second = cascade.apply(pool).unwrap();

        let labels = |o: &CascadeOutcome| {
            let mut v: Vec<(String, AggregateStatus)> = o
                .accepted
                .iter()
                .chain(o.rejected.iter())
                .map(|c| (c.id.clone(), c.status))
                .collect();
            v.sort();
            v
        };
        assert_eq!(labels(&first), labels(&second));
    }

    #[test]
    fn test_relaxation_admits_and_tags() {
        // Threshold 2060 with margin gap 100; candidate at 2055 needs
        // 5% relaxation, within the 10% cap (2060 − 0.10·100 = 2050).
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 2,
            max_threshold_relaxation: 0.10,
            relaxation_steps: 4,
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let outcome = cascade
            .apply(vec![candidate("clean", Some(2100.0)), candidate("edge", Some(2055.0))])
            .unwrap();

        assert_eq!(outcome.accepted.len(), 2);
        let edge = outcome.accepted.iter().find(|c| c.id == "edge").unwrap();
        assert_eq!(edge.status, AggregateStatus::AcceptedWithRelaxation);
        assert!(edge.risk_flags.iter().any(|f| f == "relaxed"));

        let record = outcome.relaxation.unwrap();
        assert_eq!(record.admitted_by_relaxation, vec!["edge".to_string()]);
        let relax = &record.relaxed_stages[0];
        assert!(relax.fraction <= 0.10 + 1e-12);
        assert!(relax.relaxed_threshold <= 2055.0);
        assert!(relax.relaxed_threshold >= 2050.0 - 1e-9);
    }

    #[test]
    fn test_relaxation_never_exceeds_cap() {
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let stages = vec![binding_stage()];
        let fallback = FallbackConfig {
            min_candidates: 2,
            max_threshold_relaxation: 0.10,
            relaxation_steps: 4,
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        // 2049 sits below the relaxation floor of 2050; the cap must hold
        // and the run must fail loudly.
        let result = cascade.apply(vec![
            candidate("clean", Some(2100.0)),
            candidate("too-low", Some(2049.0)),
        ]);
        assert!(matches!(
            result,
            Err(TriageError::InsufficientCandidates { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_first_priority_relaxes_before_hard_cap_phase() {
        // Humanness (First) is fully relaxable; binding (Last) is capped.
        // A candidate failing humanness by a hair is admitted in phase 1
        // without touching the binding threshold.
        let calibration = calibration_with(keys::INTERFACE_AREA, 2060.0, 100.0, true);
        let mut config = RunConfig::default();
        config.stages.retain(|s| s.name == "binding-quality" || s.name == "humanness");
        let stages = config.stages;
        let fallback = FallbackConfig {
            min_candidates: 2,
            max_threshold_relaxation: 0.10,
            relaxation_steps: 4,
        };
        let cascade = FilterCascade::new(&stages, &calibration, &fallback);

        let mut clean = candidate("clean", Some(2100.0));
        clean.metrics.set(keys::HUMANNESS, 0.9);
        let mut low_human = candidate("low-human", Some(2100.0));
        low_human.metrics.set(keys::HUMANNESS, 0.74);

        let outcome = cascade.apply(vec![clean, low_human]).unwrap();
        assert_eq!(outcome.accepted.len(), 2);

        let record = outcome.relaxation.unwrap();
        assert!(record.relaxed_stages.iter().all(|r| r.stage == "humanness"));
        assert_eq!(record.admitted_by_relaxation, vec!["low-human".to_string()]);
    }
}
