//! External collaborator seams.
//!
//! The pipeline consumes three external services through trait objects:
//! structure prediction, antibody numbering, and humanness scoring. Each
//! call carries a deadline enforced by the implementation and a small fixed
//! retry budget enforced here. Production deployments plug in real service
//! clients; the `precomputed` implementations below run the pipeline on
//! prediction outputs produced offline, which is also what the CLI uses.

use abtriage_core::errors::{Result, TriageError};
use abtriage_core::metrics::MetricSet;
use abtriage_core::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Structure prediction service: sequences in, confidence metrics out.
pub trait PredictionService: Send + Sync {
    /// Predict the binder/target complex and return its metric map.
    /// Metrics the backend cannot produce are simply omitted.
    fn predict(
        &self,
        binder_sequences: &[String],
        target_reference: &str,
        deadline: Duration,
    ) -> Result<MetricSet>;
}

/// CDR/framework boundaries of a binder chain, as residue index ranges
/// (0-indexed, half-open) into the query sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap {
    pub cdr_ranges: Vec<(usize, usize)>,
    pub framework_ranges: Vec<(usize, usize)>,
}

impl RegionMap {
    pub fn position_in_cdr(&self, idx: usize) -> bool {
        self.cdr_ranges.iter().any(|&(s, e)| idx >= s && idx < e)
    }
}

/// Antibody numbering service: maps a sequence to CDR/framework regions.
pub trait NumberingService: Send + Sync {
    fn number(&self, sequence: &str, deadline: Duration) -> Result<RegionMap>;
}

/// Humanness scoring service: one or two chains in, scalar score out.
/// `Ok(None)` means the scorer declined (e.g. non-antibody scaffold).
pub trait HumannessService: Send + Sync {
    fn score(
        &self,
        primary: &str,
        secondary: Option<&str>,
        deadline: Duration,
    ) -> Result<Option<f64>>;
}

/// Retry budget for a single external call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            attempts: runtime.retry_attempts,
            deadline: Duration::from_secs(runtime.call_timeout_secs),
        }
    }

    /// Run `call` up to `attempts` times, retrying only retriable errors.
    /// The last error is returned once the budget is exhausted.
    pub fn run<T>(&self, context: &str, mut call: impl FnMut(Duration) -> Result<T>) -> Result<T> {
        let mut last_err = TriageError::internal(format!("{context}: no attempts made"));
        for attempt in 1..=self.attempts.max(1) {
            match call(self.deadline) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.attempts => {
                    log::warn!("{context}: attempt {attempt} failed, retrying: {e}");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

/// Prediction outputs captured from an offline run, keyed by the query's
/// primary sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecomputedPredictions {
    pub by_sequence: HashMap<String, MetricSet>,
}

impl PrecomputedPredictions {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl PredictionService for PrecomputedPredictions {
    fn predict(
        &self,
        binder_sequences: &[String],
        target_reference: &str,
        _deadline: Duration,
    ) -> Result<MetricSet> {
        let key = binder_sequences
            .first()
            .ok_or_else(|| TriageError::prediction("empty binder sequence list"))?;
        self.by_sequence.get(key).cloned().ok_or_else(|| {
            TriageError::prediction(format!(
                "no precomputed prediction for sequence against '{target_reference}'"
            ))
        })
    }
}

/// Numbering results captured offline, keyed by sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecomputedNumbering {
    pub by_sequence: HashMap<String, RegionMap>,
}

impl NumberingService for PrecomputedNumbering {
    fn number(&self, sequence: &str, _deadline: Duration) -> Result<RegionMap> {
        self.by_sequence.get(sequence).cloned().ok_or_else(|| {
            TriageError::prediction("no precomputed numbering for sequence".to_string())
        })
    }
}

/// Humanness scores captured offline, keyed by primary sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecomputedHumanness {
    pub by_sequence: HashMap<String, f64>,
}

impl HumannessService for PrecomputedHumanness {
    fn score(
        &self,
        primary: &str,
        _secondary: Option<&str>,
        _deadline: Duration,
    ) -> Result<Option<f64>> {
        Ok(self.by_sequence.get(primary).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_policy_retries_retriable_then_succeeds() {
        let policy = RetryPolicy {
            attempts: 3,
            deadline: Duration::from_secs(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = policy.run("test call", |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TriageError::timeout("slow backend"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_policy_gives_up_after_budget() {
        let policy = RetryPolicy {
            attempts: 2,
            deadline: Duration::from_secs(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = policy.run("test call", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TriageError::timeout("slow backend"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_policy_does_not_retry_fatal() {
        let policy = RetryPolicy {
            attempts: 3,
            deadline: Duration::from_secs(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = policy.run("test call", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TriageError::config("bad input"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_precomputed_prediction_lookup() {
        let mut store = PrecomputedPredictions::default();
        let mut metrics = MetricSet::new();
        metrics.set("iptm", 0.85);
        store.by_sequence.insert("EVQLV".to_string(), metrics);

        let out = store
            .predict(&["EVQLV".to_string()], "target-G", Duration::from_secs(1))
            .unwrap();
        assert_eq!(out.get("iptm"), Some(0.85));

        let miss = store.predict(&["MISSING".to_string()], "target-G", Duration::from_secs(1));
        assert!(matches!(miss, Err(TriageError::Prediction(_))));
    }

    #[test]
    fn test_region_map_lookup() {
        let map = RegionMap {
            cdr_ranges: vec![(25, 33), (50, 58)],
            framework_ranges: vec![(0, 25), (33, 50)],
        };
        assert!(map.position_in_cdr(25));
        assert!(map.position_in_cdr(32));
        assert!(!map.position_in_cdr(33));
        assert!(!map.position_in_cdr(10));
    }
}
