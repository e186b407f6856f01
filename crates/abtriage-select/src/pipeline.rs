//! End-to-end triage run orchestration.
//!
//! Wires the stages in dependency order: parallel enrichment, epitope
//! classification, calibration, filter cascade, ranking and diversity
//! selection. Produces a timestamped `RunReport` carrying everything an
//! audit needs: the calibration table, per-candidate outcomes, the
//! relaxation record if the fallback fired, and the final ordered selection.

use crate::calibration::{calibration_directions, CalibrationEngine, CalibrationResult, Control};
use crate::cascade::{FilterCascade, RelaxationRecord};
use crate::collaborators::{HumannessService, NumberingService, PredictionService, RetryPolicy};
use crate::enrichment::Enricher;
use crate::epitope::{CanonicalReference, EpitopeAligner};
use crate::ranking::RankingEngine;
use abtriage_core::candidate::{Candidate, EpitopeClass};
use abtriage_core::config::RunConfig;
use abtriage_core::errors::TriageError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

/// External collaborators handed to a run.
pub struct Collaborators<'a> {
    pub prediction: &'a dyn PredictionService,
    pub numbering: &'a dyn NumberingService,
    pub humanness: &'a dyn HumannessService,
}

/// Full output of one triage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub target_reference: String,
    /// Configuration the run used, echoed for reproducibility.
    pub config: RunConfig,
    pub n_candidates: usize,
    pub n_scored: usize,
    pub calibration: CalibrationResult,
    pub relaxation: Option<RelaxationRecord>,
    /// Final ordered selection, rank reports attached.
    pub selected: Vec<Candidate>,
    /// Accepted but not picked by diversity selection.
    pub accepted_unselected: Vec<Candidate>,
    pub rejected: Vec<Candidate>,
}

impl RunReport {
    /// Persist as pretty JSON under `out_dir`, named by start time.
    pub fn save(&self, out_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("creating report directory {out_dir:?}"))?;
        let filename = format!("triage_{}.json", self.started.format("%Y%m%d_%H%M%S"));
        let path = out_dir.join(filename);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).with_context(|| format!("writing report {path:?}"))?;
        log::info!("saved triage report to {path:?}");
        Ok(path)
    }

    /// Human-readable run summary.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push("═══════════════════════════════════════════════════════════".to_string());
        lines.push(format!("  TRIAGE RUN: {}", self.target_reference));
        lines.push("═══════════════════════════════════════════════════════════".to_string());
        lines.push(format!(
            "  candidates: {} scored / {} total; accepted: {}; rejected: {}",
            self.n_scored,
            self.n_candidates,
            self.selected.len() + self.accepted_unselected.len(),
            self.rejected.len()
        ));

        lines.push(String::new());
        lines.push("  calibrated thresholds:".to_string());
        for (metric, t) in &self.calibration.thresholds {
            lines.push(format!(
                "    {metric}: {:.3} (baseline {:.3}, margin {:.3}){}",
                t.threshold,
                t.baseline,
                t.margin,
                if t.usable { "" } else { " [unusable]" }
            ));
        }

        if let Some(relax) = &self.relaxation {
            lines.push(String::new());
            lines.push("  threshold relaxation applied:".to_string());
            for r in &relax.relaxed_stages {
                lines.push(format!(
                    "    {}: {:.3} → {:.3} ({:.0}% of gap)",
                    r.stage,
                    r.original_threshold,
                    r.relaxed_threshold,
                    r.fraction * 100.0
                ));
            }
            lines.push(format!(
                "    admitted only by relaxation: {}",
                relax.admitted_by_relaxation.join(", ")
            ));
        }

        lines.push(String::new());
        lines.push(format!("  selected ({}):", self.selected.len()));
        for c in &self.selected {
            let rank = c.rank.as_ref();
            lines.push(format!(
                "    #{} {} [{:?}] key={:.3} overlap={:.3} flags=[{}]",
                rank.map_or(0, |r| r.position),
                c.id,
                c.epitope.class,
                rank.map_or(f64::NAN, |r| r.quality_key),
                c.epitope.overlap,
                c.risk_flags.join(", ")
            ));
        }
        lines.push("═══════════════════════════════════════════════════════════".to_string());
        lines.join("\n")
    }
}

/// Runs the full triage pipeline for one batch.
pub struct TriageRunner<'a> {
    config: &'a RunConfig,
    collaborators: Collaborators<'a>,
}

impl<'a> TriageRunner<'a> {
    pub fn new(config: &'a RunConfig, collaborators: Collaborators<'a>) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Execute the run. `cancel` may be flipped by the caller at any time;
    /// candidates not yet scored then stay explicitly unscored and are
    /// soft-skipped by any stage needing their metrics.
    pub fn run(
        &self,
        mut candidates: Vec<Candidate>,
        controls: &[Control],
        target_reference: &str,
        cancel: &AtomicBool,
    ) -> Result<RunReport> {
        let started = Utc::now();
        self.config.validate().context("run configuration")?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.runtime.workers)
            .build()
            .map_err(|e| TriageError::internal(format!("worker pool: {e}")))?;
        let policy = RetryPolicy::from_runtime(&self.config.runtime);

        // Enrichment: embarrassingly parallel, candidate-local failures.
        let enricher = Enricher::new(
            self.collaborators.prediction,
            self.collaborators.numbering,
            self.collaborators.humanness,
            policy,
            target_reference,
        );
        let n_scored = pool.install(|| enricher.enrich_batch(&mut candidates, cancel));
        log::info!("enriched {n_scored}/{} candidates", candidates.len());

        self.classify_epitopes(&mut candidates);

        // Calibration blocks until every control is scored (or fails).
        let directions = calibration_directions(&self.config.stages);
        let engine = CalibrationEngine::new(self.collaborators.prediction, policy);
        let calibration = pool
            .install(|| engine.calibrate(controls, &self.config.calibration, &directions))
            .context("threshold calibration")?;

        let n_candidates = candidates.len();
        let cascade = FilterCascade::new(&self.config.stages, &calibration, &self.config.fallback);
        let outcome = cascade.apply(candidates).context("filter cascade")?;

        let ranking = RankingEngine::new(&self.config.ranking, &self.config.diversity);
        let accepted = outcome.accepted;
        let selected = ranking.rank_and_select(accepted.clone(), self.config.select_n);

        let selected_ids: Vec<&str> = selected.iter().map(|c| c.id.as_str()).collect();
        let accepted_unselected: Vec<Candidate> = accepted
            .into_iter()
            .filter(|c| !selected_ids.contains(&c.id.as_str()))
            .collect();

        Ok(RunReport {
            started,
            finished: Utc::now(),
            target_reference: target_reference.to_string(),
            config: self.config.clone(),
            n_candidates,
            n_scored,
            calibration,
            relaxation: outcome.relaxation,
            selected,
            accepted_unselected,
            rejected: outcome.rejected,
        })
    }

    /// Attach an epitope call to every candidate with a predicted target
    /// sequence. A fusion reference is corroborating-only: its calls are
    /// recorded but downgraded to an informational flag.
    fn classify_epitopes(&self, candidates: &mut [Candidate]) {
        let Some(ep_config) = &self.config.epitope else {
            return;
        };
        let Some(reference) = CanonicalReference::from_config(ep_config) else {
            log::error!("epitope reference sequence/numbering mismatch; skipping classification");
            return;
        };
        let aligner = EpitopeAligner::new(
            &reference,
            &ep_config.epitope_positions,
            ep_config.overlap_threshold,
        );

        for candidate in candidates.iter_mut() {
            let Some(predicted) = candidate.predicted_target_seq.clone() else {
                continue;
            };
            candidate.epitope = aligner.classify(&predicted, &candidate.contact_positions);
            if reference.fusion {
                candidate.flag("epitope_reference_is_fusion_construct");
            }
            match candidate.epitope.class {
                EpitopeClass::Unknown => candidate.flag("epitope_unmappable"),
                EpitopeClass::Novel => candidate.flag("novel_epitope"),
                EpitopeClass::KnownLike => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abtriage_core::candidate::{BinderChains, SourceTrack};
    use abtriage_core::metrics::{keys, MetricSet};
    use std::collections::HashMap;
    use std::time::Duration;

    struct MapPrediction(HashMap<String, MetricSet>);

    impl PredictionService for MapPrediction {
        fn predict(
            &self,
            sequences: &[String],
            _: &str,
            _: Duration,
        ) -> abtriage_core::errors::Result<MetricSet> {
            self.0
                .get(&sequences[0])
                .cloned()
                .ok_or_else(|| TriageError::prediction("unknown sequence"))
        }
    }

    struct NoNumbering;
    impl NumberingService for NoNumbering {
        fn number(
            &self,
            _: &str,
            _: Duration,
        ) -> abtriage_core::errors::Result<crate::collaborators::RegionMap> {
            Ok(crate::collaborators::RegionMap::default())
        }
    }

    struct FixedHumanness(f64);
    impl HumannessService for FixedHumanness {
        fn score(
            &self,
            _: &str,
            _: Option<&str>,
            _: Duration,
        ) -> abtriage_core::errors::Result<Option<f64>> {
            Ok(Some(self.0))
        }
    }

    fn seq(i: usize) -> String {
        // Distinct but realistic-length binder sequences.
        let alphabet = "ACDEFGHIKLMNPQRSTVWY";
        let mut s = String::from("EVQLVESGGGLVQPGGSLRLSCAAS");
        s.push(alphabet.as_bytes()[i % 20] as char);
        s.push(alphabet.as_bytes()[(i * 7) % 20] as char);
        s
    }

    fn metric_set(area: f64, iptm: f64) -> MetricSet {
        let mut m = MetricSet::new();
        m.set(keys::INTERFACE_AREA, area);
        m.set(keys::IPTM, iptm);
        m
    }

    #[test]
    fn test_end_to_end_run_selects_and_reports() {
        let mut config = RunConfig::default();
        config.fallback.min_candidates = 2;
        config.select_n = 3;
        // Keep only the calibrated binding stage plus liabilities; the
        // stubbed collaborators cover those paths.
        config
            .stages
            .retain(|s| s.name == "binding-quality" || s.name == "sequence-liabilities");

        let mut store = HashMap::new();
        // Controls.
        store.insert("CTRL-A".to_string(), metric_set(2560.0, 0.90));
        store.insert("CTRL-B".to_string(), metric_set(2160.0, 0.85));
        // Candidates: two above the 2060 threshold, one below.
        store.insert(seq(0), metric_set(2400.0, 0.88));
        store.insert(seq(1), metric_set(2100.0, 0.80));
        store.insert(seq(2), metric_set(1800.0, 0.95));
        let prediction = MapPrediction(store);

        let collaborators = Collaborators {
            prediction: &prediction,
            numbering: &NoNumbering,
            humanness: &FixedHumanness(0.9),
        };
        let runner = TriageRunner::new(&config, collaborators);

        let candidates: Vec<Candidate> = (0..3)
            .map(|i| {
                Candidate::new(
                    format!("cand-{i}"),
                    SourceTrack::Generated,
                    BinderChains::single(seq(i)),
                )
            })
            .collect();
        let controls = vec![
            Control {
                name: "ctrl-a".to_string(),
                binder_sequences: vec!["CTRL-A".to_string()],
                target_reference: "tgt".to_string(),
            },
            Control {
                name: "ctrl-b".to_string(),
                binder_sequences: vec!["CTRL-B".to_string()],
                target_reference: "tgt".to_string(),
            },
        ];

        let report = runner
            .run(candidates, &controls, "tgt", &AtomicBool::new(false))
            .unwrap();

        assert_eq!(report.n_scored, 3);
        assert_eq!(report.selected.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].id, "cand-2");
        assert!(report.relaxation.is_none());
        // Selected candidates carry rank positions 1..n.
        assert_eq!(report.selected[0].rank.as_ref().unwrap().position, 1);

        let text = report.render();
        assert!(text.contains("TRIAGE RUN"));
        assert!(text.contains("interface_area"));
    }

    #[test]
    fn test_report_round_trips_to_disk() {
        let report = RunReport {
            started: Utc::now(),
            finished: Utc::now(),
            target_reference: "tgt".to_string(),
            config: RunConfig::default(),
            n_candidates: 0,
            n_scored: 0,
            calibration: CalibrationResult {
                controls: Default::default(),
                thresholds: Default::default(),
            },
            relaxation: None,
            selected: Vec::new(),
            accepted_unselected: Vec::new(),
            rejected: Vec::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = report.save(dir.path()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let loaded: RunReport = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.target_reference, "tgt");
    }
}
