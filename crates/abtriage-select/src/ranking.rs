//! Worst-metric-rank quality scoring and diversity-aware selection.
//!
//! Each tracked metric ranks the candidates that carry it (1 = best). The
//! rank is divided by the metric's importance weight, and a candidate's
//! quality key is its single worst weighted rank: no metric can be
//! arbitrarily bad while the others compensate. Selection is then greedy
//! maximin: quality blended with dissimilarity to the already-selected set,
//! so near-duplicate binders do not crowd the final list.

use crate::epitope::sequence_identity;
use abtriage_core::candidate::{Candidate, RankReport};
use abtriage_core::config::{DiversityConfig, RankingConfig};
use std::collections::HashMap;

/// Quality scoring artifacts for one candidate, pre-selection.
#[derive(Debug, Clone)]
struct ScoredCandidate {
    candidate: Candidate,
    quality_key: f64,
    metric_ranks: Vec<(String, usize)>,
}

pub struct RankingEngine<'a> {
    ranking: &'a RankingConfig,
    diversity: &'a DiversityConfig,
}

impl<'a> RankingEngine<'a> {
    pub fn new(ranking: &'a RankingConfig, diversity: &'a DiversityConfig) -> Self {
        Self { ranking, diversity }
    }

    /// Rank the accepted pool and pick the final ordered selection of up to
    /// `n` candidates. With `alpha = 0` this is exactly top-`n` by quality.
    pub fn rank_and_select(&self, accepted: Vec<Candidate>, n: usize) -> Vec<Candidate> {
        if accepted.is_empty() || n == 0 {
            return Vec::new();
        }

        let mut scored = self.score_pool(accepted);

        // Ascending by worst weighted rank; ties broken on the primary
        // metric (higher is better), then id, so the order is total.
        scored.sort_by(|a, b| {
            a.quality_key
                .partial_cmp(&b.quality_key)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let pa = self.primary_value(&a.candidate);
                    let pb = self.primary_value(&b.candidate);
                    pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });

        let pool_size = scored.len();
        let quality_norms: Vec<f64> = (0..pool_size)
            .map(|pos| 1.0 - pos as f64 / pool_size as f64)
            .collect();

        let picks = self.greedy_diverse(&scored, &quality_norms, n);

        let mut selected = Vec::with_capacity(picks.len());
        // Consume the pool in pick order without disturbing indices.
        let mut pool: Vec<Option<ScoredCandidate>> = scored.into_iter().map(Some).collect();
        for (position, idx) in picks.iter().enumerate() {
            let entry = pool[*idx].take().expect("pick indices are unique");
            let mut candidate = entry.candidate;
            candidate.rank = Some(RankReport {
                position: position + 1,
                quality_key: entry.quality_key,
                quality_norm: quality_norms[*idx],
                metric_ranks: entry.metric_ranks,
            });
            selected.push(candidate);
        }

        log::info!(
            "selected {}/{} candidates (alpha = {:.2})",
            selected.len(),
            pool_size,
            self.diversity.alpha
        );
        selected
    }

    /// Per-metric competition ranks and the worst-weighted-rank quality key.
    fn score_pool(&self, accepted: Vec<Candidate>) -> Vec<ScoredCandidate> {
        let mut ranks: Vec<Vec<(String, usize)>> = vec![Vec::new(); accepted.len()];

        for metric in self.ranking.weights.keys() {
            let mut holders: Vec<(usize, f64)> = accepted
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.metrics.get(metric).map(|v| (i, v)))
                .collect();
            if holders.is_empty() {
                continue;
            }

            let lower_better = self.ranking.lower_is_better.contains(metric);
            holders.sort_by(|(ia, va), (ib, vb)| {
                let primary = if lower_better {
                    va.partial_cmp(vb)
                } else {
                    vb.partial_cmp(va)
                }
                .unwrap_or(std::cmp::Ordering::Equal);
                primary
                    .then_with(|| {
                        let pa = self.primary_value(&accepted[*ia]);
                        let pb = self.primary_value(&accepted[*ib]);
                        pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| accepted[*ia].id.cmp(&accepted[*ib].id))
            });

            // Competition ranking: equal values share the best position.
            let mut rank = 1usize;
            for (pos, (idx, value)) in holders.iter().enumerate() {
                if pos > 0 && holders[pos - 1].1 != *value {
                    rank = pos + 1;
                }
                ranks[*idx].push((metric.clone(), rank));
            }
        }

        accepted
            .into_iter()
            .zip(ranks)
            .map(|(candidate, metric_ranks)| {
                let quality_key = metric_ranks
                    .iter()
                    .map(|(metric, rank)| {
                        self.ranking.weights[metric].effective_rank(*rank)
                    })
                    .fold(f64::NEG_INFINITY, f64::max);
                // A candidate with no ranked metric sorts after everything.
                let quality_key = if metric_ranks.is_empty() {
                    f64::INFINITY
                } else {
                    quality_key
                };
                ScoredCandidate {
                    candidate,
                    quality_key,
                    metric_ranks,
                }
            })
            .collect()
    }

    fn primary_value(&self, candidate: &Candidate) -> f64 {
        candidate
            .metrics
            .get(&self.ranking.primary_metric)
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// Greedy maximin picks over the quality-sorted pool.
    ///
    /// Each step maximizes `(1−α)·quality_norm + α·(1 − max identity to the
    /// selected set)`. The first pick is the best quality_norm. Inherently
    /// sequential: every pick depends on all prior picks.
    fn greedy_diverse(
        &self,
        scored: &[ScoredCandidate],
        quality_norms: &[f64],
        n: usize,
    ) -> Vec<usize> {
        let alpha = self.diversity.alpha;
        let target = n.min(scored.len());
        let mut picks: Vec<usize> = Vec::with_capacity(target);
        let mut remaining: Vec<usize> = (0..scored.len()).collect();
        let mut identity_cache: HashMap<(usize, usize), f64> = HashMap::new();

        while picks.len() < target {
            let best_pos = if picks.is_empty() {
                0 // pool is quality-sorted; index 0 is the best candidate
            } else {
                let mut best = 0usize;
                let mut best_score = f64::NEG_INFINITY;
                for (pos, &idx) in remaining.iter().enumerate() {
                    let max_identity = picks
                        .iter()
                        .map(|&sel| {
                            let key = (idx.min(sel), idx.max(sel));
                            *identity_cache.entry(key).or_insert_with(|| {
                                sequence_identity(
                                    &scored[idx].candidate.chains.primary,
                                    &scored[sel].candidate.chains.primary,
                                )
                            })
                        })
                        .fold(f64::NEG_INFINITY, f64::max);
                    let score = (1.0 - alpha) * quality_norms[idx] + alpha * (1.0 - max_identity);
                    // Strict comparison keeps quality order on ties.
                    if score > best_score {
                        best_score = score;
                        best = pos;
                    }
                }
                best
            };
            picks.push(remaining.remove(best_pos));
        }
        picks
    }
}
