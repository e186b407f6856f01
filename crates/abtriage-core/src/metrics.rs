//! Metric model for candidate evaluation.
//!
//! Every structural/sequence metric is optional per candidate: a metric can
//! be genuinely absent (backend did not emit it, or scoring was cancelled)
//! and absence must stay distinguishable from a present value of zero.
//! A filter stage soft-skips an absent metric but evaluates a present zero
//! normally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical metric names used across calibration, filtering, and ranking.
pub mod keys {
    /// Interface predicted TM-score (structural confidence of the complex).
    pub const IPTM: &str = "iptm";
    /// Mean predicted LDDT over the binder chain(s).
    pub const PLDDT: &str = "plddt";
    /// Predicted aligned error across the binder/target interface.
    pub const PAE_INTERACTION: &str = "pae_interaction";
    /// Buried interface area in square Angstroms.
    pub const INTERFACE_AREA: &str = "interface_area";
    /// Number of binder/target residue contacts.
    pub const CONTACT_COUNT: &str = "contact_count";
    /// Humanness score from the humanness collaborator.
    pub const HUMANNESS: &str = "humanness";
    /// Predicted aggregation propensity (lower is better).
    pub const AGGREGATION: &str = "aggregation_propensity";
    /// Developability composite from sequence-property scanning.
    pub const DEVELOPABILITY: &str = "developability";
}

/// A single metric slot: a present numeric value or an explicit absence.
///
/// Serialized as `{"value": 0.82}` or `"absent"` so a report never conflates
/// "zero" with "not scored".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Value(f64),
    Absent,
}

impl MetricValue {
    /// Present numeric value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Value(v) => Some(*v),
            MetricValue::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, MetricValue::Absent)
    }
}

/// Named metric values for one candidate or control.
///
/// Backed by a `BTreeMap` so iteration order (and therefore every report and
/// tie-break that walks the metrics) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    values: BTreeMap<String, MetricValue>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a present value.
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), MetricValue::Value(value));
    }

    /// Mark a metric explicitly absent (scoring degraded or cancelled).
    pub fn set_absent(&mut self, name: impl Into<String>) {
        self.values.insert(name.into(), MetricValue::Absent);
    }

    /// Present value for `name`, or `None` if missing or marked absent.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(MetricValue::value)
    }

    /// True if the metric has a present numeric value.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of all metrics with present values, in deterministic order.
    pub fn present_names(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| !v.is_absent())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, f64)> for MetricSet {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut set = MetricSet::new();
        for (k, v) in iter {
            set.set(k, v);
        }
        set
    }
}

/// Importance weight for a ranked metric.
///
/// The weight acts as a divisor on the metric's integer rank:
/// `effective_rank = rank / weight`. A higher weight shrinks the rank less,
/// so poor performance on an important metric dominates the worst-rank
/// quality key. Wrapped in a newtype so the inversion cannot be applied
/// backwards at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportanceWeight(f64);

impl ImportanceWeight {
    /// Weights below 1.0 would let an unimportant metric outrank an
    /// important one, so they are rejected at construction.
    pub fn new(weight: f64) -> Result<Self, String> {
        if !weight.is_finite() || weight < 1.0 {
            return Err(format!("importance weight must be >= 1.0, got {weight}"));
        }
        Ok(Self(weight))
    }

    pub fn get(&self) -> f64 {
        self.0
    }

    /// Rank adjusted for importance: `rank / weight`.
    pub fn effective_rank(&self, rank: usize) -> f64 {
        rank as f64 / self.0
    }
}

impl Default for ImportanceWeight {
    fn default() -> Self {
        Self(1.0)
    }
}
