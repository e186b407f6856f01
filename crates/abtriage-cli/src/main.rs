//! ABTRIAGE CLI entry point.
//!
//! Runs the binder candidate triage pipeline on prediction outputs produced
//! offline: load candidates, known-positive controls, and precomputed
//! collaborator results, then calibrate, filter, rank, and write the run
//! report.

use abtriage_core::candidate::{BinderChains, Candidate, LiabilitySite, SourceTrack};
use abtriage_core::config::RunConfig;
use abtriage_select::collaborators::{
    PrecomputedHumanness, PrecomputedNumbering, PrecomputedPredictions,
};
use abtriage_select::pipeline::{Collaborators, TriageRunner};
use abtriage_select::Control;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "abtriage")]
#[command(version = VERSION)]
#[command(about = "Select a diverse set of high-quality binder candidates", long_about = None)]
struct Args {
    /// Candidate pool JSON (array of candidate records)
    #[arg(long)]
    candidates: PathBuf,

    /// Known-positive controls JSON (array of controls)
    #[arg(long)]
    controls: PathBuf,

    /// Precomputed structure-prediction metrics JSON, keyed by sequence
    #[arg(long)]
    predictions: PathBuf,

    /// Precomputed CDR/framework numbering JSON, keyed by sequence
    #[arg(long)]
    numbering: Option<PathBuf>,

    /// Precomputed humanness scores JSON, keyed by sequence
    #[arg(long)]
    humanness: Option<PathBuf>,

    /// Run configuration JSON; defaults to the standard five-stage cascade
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target reference identifier passed to the prediction collaborator
    #[arg(long)]
    target: String,

    /// Output directory for the run report
    #[arg(long, default_value = "triage_results")]
    out: PathBuf,

    /// Override the configured size of the final selection
    #[arg(long)]
    select_n: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Candidate record as it appears in the input pool file.
#[derive(Debug, Deserialize)]
struct CandidateInput {
    id: String,
    track: SourceTrack,
    primary: String,
    #[serde(default)]
    secondary: Option<String>,
    #[serde(default)]
    predicted_target_seq: Option<String>,
    #[serde(default)]
    contact_positions: Vec<usize>,
    #[serde(default)]
    liability_sites: Vec<LiabilitySite>,
}

impl CandidateInput {
    fn into_candidate(self) -> Candidate {
        let chains = match self.secondary {
            Some(secondary) => BinderChains::paired(self.primary, secondary),
            None => BinderChains::single(self.primary),
        };
        let mut candidate = Candidate::new(self.id, self.track, chains);
        candidate.predicted_target_seq = self.predicted_target_seq;
        candidate.contact_positions = self.contact_positions;
        candidate.liability_sites = self.liability_sites;
        candidate
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("loading run configuration {path:?}"))?,
        None => RunConfig::default(),
    };
    if let Some(n) = args.select_n {
        config.select_n = n;
    }

    let candidates: Vec<CandidateInput> = read_json(&args.candidates)?;
    let candidates: Vec<Candidate> = candidates
        .into_iter()
        .map(CandidateInput::into_candidate)
        .collect();
    let controls: Vec<Control> = read_json(&args.controls)?;
    log::info!(
        "loaded {} candidates, {} controls",
        candidates.len(),
        controls.len()
    );

    let predictions = PrecomputedPredictions::from_file(&args.predictions)
        .with_context(|| format!("loading predictions {:?}", args.predictions))?;
    let numbering: PrecomputedNumbering = match &args.numbering {
        Some(path) => read_json(path)?,
        None => PrecomputedNumbering::default(),
    };
    let humanness: PrecomputedHumanness = match &args.humanness {
        Some(path) => read_json(path)?,
        None => PrecomputedHumanness::default(),
    };

    let runner = TriageRunner::new(
        &config,
        Collaborators {
            prediction: &predictions,
            numbering: &numbering,
            humanness: &humanness,
        },
    );

    let cancel = AtomicBool::new(false);
    let report = runner.run(candidates, &controls, &args.target, &cancel)?;

    let path = report.save(&args.out)?;
    println!("{}", report.render());
    println!("\nreport written to {}", path.display());
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {path:?}"))
}
