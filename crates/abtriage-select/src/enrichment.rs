//! Per-candidate metric enrichment.
//!
//! Each candidate is scored by the external collaborators before filtering:
//! structure prediction metrics, humanness, and CDR/framework scoping of
//! liability occurrences. The calls are order-independent with no shared
//! mutable state, so the batch fans out across the bounded worker pool.
//! Failures stay candidate-local: a collaborator that exhausts its retry
//! budget degrades that candidate's metric to absent (a soft-skip at filter
//! time) and never aborts the batch. Cancellation leaves every not-yet-
//! scored candidate explicitly `Unscored`.

use crate::collaborators::{
    HumannessService, NumberingService, PredictionService, RegionMap, RetryPolicy,
};
use abtriage_core::candidate::{Candidate, LiabilitySummary, ScoringState};
use abtriage_core::metrics::keys;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Enricher<'a> {
    prediction: &'a dyn PredictionService,
    numbering: &'a dyn NumberingService,
    humanness: &'a dyn HumannessService,
    policy: RetryPolicy,
    target_reference: String,
}

impl<'a> Enricher<'a> {
    pub fn new(
        prediction: &'a dyn PredictionService,
        numbering: &'a dyn NumberingService,
        humanness: &'a dyn HumannessService,
        policy: RetryPolicy,
        target_reference: impl Into<String>,
    ) -> Self {
        Self {
            prediction,
            numbering,
            humanness,
            policy,
            target_reference: target_reference.into(),
        }
    }

    /// Enrich the whole batch in parallel. Returns the number of candidates
    /// actually scored (the rest saw the cancel flag first).
    pub fn enrich_batch(&self, candidates: &mut [Candidate], cancel: &AtomicBool) -> usize {
        candidates
            .par_iter_mut()
            .map(|candidate| {
                if cancel.load(Ordering::Relaxed) {
                    // Explicit unscored state; hard filters requiring these
                    // metrics will soft-skip, never default to pass or fail.
                    candidate.scoring = ScoringState::Unscored;
                    return 0usize;
                }
                self.enrich_one(candidate);
                1
            })
            .sum()
    }

    fn enrich_one(&self, candidate: &mut Candidate) {
        let mut sequences = vec![candidate.chains.primary.clone()];
        if let Some(secondary) = &candidate.chains.secondary {
            sequences.push(secondary.clone());
        }

        match self.policy.run(
            &format!("predict candidate '{}'", candidate.id),
            |deadline| {
                self.prediction
                    .predict(&sequences, &self.target_reference, deadline)
            },
        ) {
            Ok(metrics) => {
                for (name, value) in metrics.iter() {
                    match value.value() {
                        Some(v) => candidate.metrics.set(name, v),
                        None => candidate.metrics.set_absent(name),
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "candidate '{}': prediction degraded to absent metrics: {e}",
                    candidate.id
                );
                candidate.flag("prediction_unscored");
            }
        }

        match self.policy.run(
            &format!("humanness candidate '{}'", candidate.id),
            |deadline| {
                self.humanness.score(
                    &candidate.chains.primary,
                    candidate.chains.secondary.as_deref(),
                    deadline,
                )
            },
        ) {
            Ok(Some(score)) => candidate.metrics.set(keys::HUMANNESS, score),
            Ok(None) => candidate.metrics.set_absent(keys::HUMANNESS),
            Err(e) => {
                log::warn!(
                    "candidate '{}': humanness degraded to absent: {e}",
                    candidate.id
                );
                candidate.metrics.set_absent(keys::HUMANNESS);
            }
        }

        self.scope_liabilities(candidate);
        candidate.scoring = ScoringState::Scored;
    }

    /// Split raw liability occurrences into CDR vs framework using the
    /// numbering collaborator's region map.
    fn scope_liabilities(&self, candidate: &mut Candidate) {
        if candidate.liability_sites.is_empty() {
            return;
        }

        let regions: RegionMap = match self.policy.run(
            &format!("numbering candidate '{}'", candidate.id),
            |deadline| self.numbering.number(&candidate.chains.primary, deadline),
        ) {
            Ok(r) => r,
            Err(e) => {
                // Without regions the occurrences cannot be scoped; the
                // liability stage will see zero counts, so surface a flag.
                log::warn!(
                    "candidate '{}': liability scoping unavailable: {e}",
                    candidate.id
                );
                candidate.flag("liability_scoping_unavailable");
                return;
            }
        };

        let mut summary = LiabilitySummary::default();
        for site in &candidate.liability_sites {
            if regions.position_in_cdr(site.position) {
                summary.cdr_count += 1;
            } else {
                summary.framework_count += 1;
            }
            if !summary.motifs.contains(&site.motif) {
                summary.motifs.push(site.motif.clone());
            }
        }
        candidate.liabilities = summary;
    }
}
