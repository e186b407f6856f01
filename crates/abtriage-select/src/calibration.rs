//! Threshold calibration from known-positive controls.
//!
//! Every control is a binder known to work; the thresholds exist to encode
//! "every known binder must pass". Each control is scored once by the
//! prediction collaborator (concurrently, under the bounded pool), and the
//! per-metric threshold is the worst control value pushed out by a safety
//! margin. A single failed control aborts calibration for the whole run:
//! there is no skip path, because silently dropping a known positive would
//! corrupt the guarantee the thresholds encode.

use crate::collaborators::{PredictionService, RetryPolicy};
use abtriage_core::config::{CalibrationConfig, StageConfig, StageRule, ThresholdSource};
use abtriage_core::errors::{Result, TriageError};
use abtriage_core::metrics::MetricSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A known-positive control sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub name: String,
    pub binder_sequences: Vec<String>,
    pub target_reference: String,
}

/// Which side of the threshold passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    /// Pass when value >= threshold; calibrated as min(controls) − margin.
    AtLeast,
    /// Pass when value <= threshold; calibrated as max(controls) + margin.
    AtMost,
}

/// One calibrated threshold with its derivation inputs kept for audit and
/// for relaxation bookkeeping (the default↔baseline gap is the margin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedThreshold {
    pub metric: String,
    pub direction: ThresholdDirection,
    /// Default threshold: baseline pushed out by the margin, clipped to the
    /// metric's domain floor.
    pub threshold: f64,
    /// Pre-margin control extreme (min for AtLeast, max for AtMost).
    pub baseline: f64,
    pub margin: f64,
    /// False when every control reported the metric's configured degenerate
    /// sentinel; the cascade never hard-gates on an unusable metric.
    pub usable: bool,
}

/// Immutable calibration output, consumed read-only by the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Raw per-metric values per control, for the audit trail.
    pub controls: BTreeMap<String, MetricSet>,
    pub thresholds: BTreeMap<String, CalibratedThreshold>,
}

impl CalibrationResult {
    pub fn threshold(&self, metric: &str) -> Option<&CalibratedThreshold> {
        self.thresholds.get(metric)
    }

    /// Usability of a metric; metrics never calibrated stay usable.
    pub fn usable(&self, metric: &str) -> bool {
        self.thresholds.get(metric).map_or(true, |t| t.usable)
    }
}

/// Threshold directions required by the configured stage list, keyed by
/// metric, for every stage that draws its threshold from calibration.
pub fn calibration_directions(stages: &[StageConfig]) -> BTreeMap<String, ThresholdDirection> {
    let mut directions = BTreeMap::new();
    for stage in stages {
        if !matches!(stage.rule.threshold_source(), Some(ThresholdSource::Calibrated)) {
            continue;
        }
        match &stage.rule {
            StageRule::MetricAtLeast { metric, .. } => {
                directions.insert(metric.clone(), ThresholdDirection::AtLeast);
            }
            StageRule::MetricAtMost { metric, .. } => {
                directions.insert(metric.clone(), ThresholdDirection::AtMost);
            }
            StageRule::LiabilityScoped { .. } => {}
        }
    }
    directions
}

/// Derives accept/reject thresholds from known-positive controls.
pub struct CalibrationEngine<'a> {
    prediction: &'a dyn PredictionService,
    policy: RetryPolicy,
}

impl<'a> CalibrationEngine<'a> {
    pub fn new(prediction: &'a dyn PredictionService, policy: RetryPolicy) -> Self {
        Self { prediction, policy }
    }

    /// Score all controls and derive one threshold per metric reported by
    /// every control. `directions` lists the metrics the stage list gates
    /// through calibration; each must end up with a usable derivation or
    /// the run aborts.
    pub fn calibrate(
        &self,
        controls: &[Control],
        config: &CalibrationConfig,
        directions: &BTreeMap<String, ThresholdDirection>,
    ) -> Result<CalibrationResult> {
        if controls.is_empty() {
            return Err(TriageError::calibration(
                "<none>",
                "at least one known-positive control is required",
            ));
        }

        // One prediction per control. Calls are independent; a single
        // failure after retries fails the whole step, never a subset.
        let scored: Vec<(String, MetricSet)> = controls
            .par_iter()
            .map(|control| {
                let metrics = self
                    .policy
                    .run(&format!("calibration predict '{}'", control.name), |deadline| {
                        self.prediction.predict(
                            &control.binder_sequences,
                            &control.target_reference,
                            deadline,
                        )
                    })
                    .map_err(|e| TriageError::calibration(&control.name, e.to_string()))?;
                log::debug!(
                    "control '{}' scored: {} metrics",
                    control.name,
                    metrics.present_names().len()
                );
                Ok((control.name.clone(), metrics))
            })
            .collect::<Result<Vec<_>>>()?;

        let control_metrics: BTreeMap<String, MetricSet> = scored.into_iter().collect();

        // Metrics reported by every control.
        let mut common: Option<Vec<String>> = None;
        for metrics in control_metrics.values() {
            let names: Vec<String> = metrics
                .present_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            common = Some(match common {
                None => names,
                Some(prev) => prev.into_iter().filter(|n| names.contains(n)).collect(),
            });
        }
        let common = common.unwrap_or_default();

        let mut thresholds = BTreeMap::new();
        for metric in &common {
            let values: Vec<f64> = control_metrics
                .values()
                .filter_map(|m| m.get(metric))
                .collect();

            let direction = directions
                .get(metric)
                .copied()
                .unwrap_or(ThresholdDirection::AtLeast);
            let margin = config.margins.get(metric).copied().unwrap_or(0.0);

            let (baseline, raw_threshold) = match direction {
                ThresholdDirection::AtLeast => {
                    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                    (min, min - margin)
                }
                ThresholdDirection::AtMost => {
                    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    (max, max + margin)
                }
            };

            let threshold = match config.domain_floors.get(metric) {
                Some(floor) => raw_threshold.max(*floor),
                None => raw_threshold,
            };

            let degenerate = config
                .degenerate_sentinels
                .get(metric)
                .map_or(false, |sentinel| values.iter().all(|v| v == sentinel));
            let usable = config
                .usable_overrides
                .get(metric)
                .copied()
                .unwrap_or(!degenerate);
            if !usable {
                log::warn!(
                    "metric '{metric}' flagged unusable (all {} controls degenerate)",
                    values.len()
                );
            }

            thresholds.insert(
                metric.clone(),
                CalibratedThreshold {
                    metric: metric.clone(),
                    direction,
                    threshold,
                    baseline,
                    margin,
                    usable,
                },
            );
        }

        // Every calibrated stage metric must have a derivation; a hard gate
        // without a threshold would otherwise fail open.
        for metric in directions.keys() {
            if !thresholds.contains_key(metric) {
                return Err(TriageError::calibration(
                    "<derivation>",
                    format!("metric '{metric}' is not reported by every control"),
                ));
            }
        }

        log::info!(
            "calibration complete: {} controls, {} thresholds",
            control_metrics.len(),
            thresholds.len()
        );

        Ok(CalibrationResult {
            controls: control_metrics,
            thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abtriage_core::metrics::keys;
    use std::time::Duration;

    struct FixedPredictions(BTreeMap<String, MetricSet>);

    impl PredictionService for FixedPredictions {
        fn predict(
            &self,
            binder_sequences: &[String],
            _target: &str,
            _deadline: Duration,
        ) -> Result<MetricSet> {
            self.0
                .get(&binder_sequences[0])
                .cloned()
                .ok_or_else(|| TriageError::prediction("unknown control"))
        }
    }

    fn control(name: &str) -> Control {
        Control {
            name: name.to_string(),
            binder_sequences: vec![name.to_string()],
            target_reference: "target-G".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            deadline: Duration::from_secs(1),
        }
    }

    fn engine_inputs(areas: &[f64]) -> (FixedPredictions, Vec<Control>) {
        let mut store = BTreeMap::new();
        let mut controls = Vec::new();
        for (i, area) in areas.iter().enumerate() {
            let name = format!("ctrl-{i}");
            let mut m = MetricSet::new();
            m.set(keys::INTERFACE_AREA, *area);
            m.set(keys::CONTACT_COUNT, 0.0);
            store.insert(name.clone(), m);
            controls.push(control(&name));
        }
        (FixedPredictions(store), controls)
    }

    #[test]
    fn test_min_minus_margin_scenario() {
        // Controls at [2560, 2160, 2240] with margin 100 calibrate to 2060.
        let (store, controls) = engine_inputs(&[2560.0, 2160.0, 2240.0]);
        let mut config = CalibrationConfig::default();
        config.margins.insert(keys::INTERFACE_AREA.to_string(), 100.0);

        let mut directions = BTreeMap::new();
        directions.insert(keys::INTERFACE_AREA.to_string(), ThresholdDirection::AtLeast);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine.calibrate(&controls, &config, &directions).unwrap();

        let t = result.threshold(keys::INTERFACE_AREA).unwrap();
        assert!((t.threshold - 2060.0).abs() < 1e-9);
        assert!((t.baseline - 2160.0).abs() < 1e-9);
        assert!(t.usable);
    }

    #[test]
    fn test_every_control_passes_its_own_threshold() {
        let (store, controls) = engine_inputs(&[1800.0, 2475.5, 1930.25, 2100.0]);
        let mut config = CalibrationConfig::default();
        config.margins.insert(keys::INTERFACE_AREA.to_string(), 50.0);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine
            .calibrate(&controls, &config, &BTreeMap::new())
            .unwrap();

        let t = result.threshold(keys::INTERFACE_AREA).unwrap();
        for metrics in result.controls.values() {
            assert!(metrics.get(keys::INTERFACE_AREA).unwrap() >= t.threshold);
        }
    }

    #[test]
    fn test_domain_floor_clips_threshold() {
        let (store, controls) = engine_inputs(&[30.0, 40.0]);
        let mut config = CalibrationConfig::default();
        config.margins.insert(keys::INTERFACE_AREA.to_string(), 100.0);
        config
            .domain_floors
            .insert(keys::INTERFACE_AREA.to_string(), 0.0);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine
            .calibrate(&controls, &config, &BTreeMap::new())
            .unwrap();
        assert!((result.threshold(keys::INTERFACE_AREA).unwrap().threshold - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_sentinel_flags_unusable() {
        let (store, controls) = engine_inputs(&[2100.0, 2200.0]);
        let mut config = CalibrationConfig::default();
        config
            .degenerate_sentinels
            .insert(keys::CONTACT_COUNT.to_string(), 0.0);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine
            .calibrate(&controls, &config, &BTreeMap::new())
            .unwrap();

        assert!(!result.usable(keys::CONTACT_COUNT));
        // Interface area carries real signal and stays usable.
        assert!(result.usable(keys::INTERFACE_AREA));
        // Metrics never calibrated default to usable.
        assert!(result.usable("never_calibrated"));
    }

    #[test]
    fn test_usable_override_wins() {
        let (store, controls) = engine_inputs(&[2100.0, 2200.0]);
        let mut config = CalibrationConfig::default();
        config
            .degenerate_sentinels
            .insert(keys::CONTACT_COUNT.to_string(), 0.0);
        config
            .usable_overrides
            .insert(keys::CONTACT_COUNT.to_string(), true);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine
            .calibrate(&controls, &config, &BTreeMap::new())
            .unwrap();
        assert!(result.usable(keys::CONTACT_COUNT));
    }

    #[test]
    fn test_failed_control_is_fatal() {
        let (store, mut controls) = engine_inputs(&[2100.0, 2200.0]);
        controls.push(control("ctrl-unknown"));

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine.calibrate(&controls, &CalibrationConfig::default(), &BTreeMap::new());
        assert!(matches!(
            result,
            Err(TriageError::FatalCalibration { .. })
        ));
    }

    #[test]
    fn test_missing_required_metric_is_fatal() {
        let (store, controls) = engine_inputs(&[2100.0, 2200.0]);
        let mut directions = BTreeMap::new();
        directions.insert(keys::IPTM.to_string(), ThresholdDirection::AtLeast);

        let engine = CalibrationEngine::new(&store, policy());
        let result = engine.calibrate(&controls, &CalibrationConfig::default(), &directions);
        assert!(matches!(result, Err(TriageError::FatalCalibration { .. })));
    }

    #[test]
    fn test_at_most_direction_uses_max_plus_margin() {
        let mut store = BTreeMap::new();
        for (name, pae) in [("ctrl-0", 6.0), ("ctrl-1", 8.5)] {
            let mut m = MetricSet::new();
            m.set(keys::PAE_INTERACTION, pae);
            store.insert(name.to_string(), m);
        }
        let controls = vec![control("ctrl-0"), control("ctrl-1")];
        let mut config = CalibrationConfig::default();
        config
            .margins
            .insert(keys::PAE_INTERACTION.to_string(), 1.0);
        let mut directions = BTreeMap::new();
        directions.insert(
            keys::PAE_INTERACTION.to_string(),
            ThresholdDirection::AtMost,
        );

        let predictions = FixedPredictions(store);
        let engine = CalibrationEngine::new(&predictions, policy());
        let result = engine.calibrate(&controls, &config, &directions).unwrap();
        let t = result.threshold(keys::PAE_INTERACTION).unwrap();
        assert!((t.threshold - 9.5).abs() < 1e-9);
        assert!((t.baseline - 8.5).abs() < 1e-9);
    }
}
