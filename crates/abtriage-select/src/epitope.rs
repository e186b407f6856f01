//! Epitope overlap classification.
//!
//! The canonical reference's residue numbering is routinely non-sequential
//! relative to a freshly predicted structure: it may start at an arbitrary
//! offset, skip residues, or (for fusion constructs) include residues absent
//! from the target's natural sequence. Predicted contacts, by contrast,
//! arrive in the predicted structure's own 1-indexed gap-free numbering.
//! The two spaces are bridged by a global sequence alignment, never by raw
//! integer comparison.

use abtriage_core::candidate::{EpitopeCall, EpitopeClass};
use abtriage_core::config::EpitopeConfig;
use std::collections::{BTreeMap, BTreeSet};

/// Canonical reference: sequence plus its original per-position numbering.
#[derive(Debug, Clone)]
pub struct CanonicalReference {
    seq: Vec<u8>,
    numbering: Vec<i32>,
    /// Fusion/non-canonical constructs are corroborating-only.
    pub fusion: bool,
}

impl CanonicalReference {
    /// Lengths of sequence and numbering must match (validated at config
    /// load; re-checked here for direct constructions).
    pub fn new(seq: &str, numbering: Vec<i32>, fusion: bool) -> Option<Self> {
        if seq.len() != numbering.len() {
            return None;
        }
        Some(Self {
            seq: seq.as_bytes().to_vec(),
            numbering,
            fusion,
        })
    }

    pub fn from_config(config: &EpitopeConfig) -> Option<Self> {
        Self::new(
            &config.reference_seq,
            config.reference_numbering.clone(),
            config.fusion_construct,
        )
    }
}

/// One aligned column: indices into each sequence, `None` on the gap side.
type Column = (Option<usize>, Option<usize>);

/// Global pairwise alignment (Needleman–Wunsch, linear gap penalty).
///
/// Implemented as an explicit iterative score/traceback table: no recursion,
/// deterministic backtracking (diagonal preferred over up over left on
/// ties, so repeated runs produce identical maps).
pub fn global_align(a: &[u8], b: &[u8]) -> Vec<Column> {
    const MATCH: i32 = 2;
    const MISMATCH: i32 = -1;
    const GAP: i32 = -2;

    const DIAG: u8 = 0;
    const UP: u8 = 1;
    const LEFT: u8 = 2;

    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    let mut score = vec![0i32; (n + 1) * width];
    let mut trace = vec![DIAG; (n + 1) * width];

    for i in 1..=n {
        score[i * width] = i as i32 * GAP;
        trace[i * width] = UP;
    }
    for j in 1..=m {
        score[j] = j as i32 * GAP;
        trace[j] = LEFT;
    }

    for i in 1..=n {
        for j in 1..=m {
            let sub = if a[i - 1] == b[j - 1] { MATCH } else { MISMATCH };
            let diag = score[(i - 1) * width + (j - 1)] + sub;
            let up = score[(i - 1) * width + j] + GAP;
            let left = score[i * width + (j - 1)] + GAP;

            let (best, dir) = if diag >= up && diag >= left {
                (diag, DIAG)
            } else if up >= left {
                (up, UP)
            } else {
                (left, LEFT)
            };
            score[i * width + j] = best;
            trace[i * width + j] = dir;
        }
    }

    let mut columns = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        match trace[i * width + j] {
            DIAG if i > 0 && j > 0 => {
                columns.push((Some(i - 1), Some(j - 1)));
                i -= 1;
                j -= 1;
            }
            UP if i > 0 => {
                columns.push((Some(i - 1), None));
                i -= 1;
            }
            _ => {
                columns.push((None, Some(j - 1)));
                j -= 1;
            }
        }
    }
    columns.reverse();
    columns
}

/// Normalized sequence identity in [0, 1]: identical matched columns over
/// total alignment columns. Used by diversity selection.
pub fn sequence_identity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let columns = global_align(a, b);
    if columns.is_empty() {
        return 0.0;
    }
    let identical = columns
        .iter()
        .filter(|(x, y)| match (x, y) {
            (Some(i), Some(j)) => a[*i] == b[*j],
            _ => false,
        })
        .count();
    identical as f64 / columns.len() as f64
}

/// Result of mapping the canonical epitope onto a predicted sequence.
#[derive(Debug, Clone)]
pub struct EpitopeMapping {
    /// Epitope positions in the predicted structure's 1-indexed numbering.
    pub mapped: BTreeSet<usize>,
    /// Canonical epitope residue numbers that landed on a gap column and
    /// were dropped rather than guessed.
    pub dropped: Vec<i32>,
}

/// Classifies a candidate's predicted contacts against the canonical
/// reference epitope.
pub struct EpitopeAligner<'a> {
    reference: &'a CanonicalReference,
    epitope_positions: &'a [i32],
    overlap_threshold: f64,
}

impl<'a> EpitopeAligner<'a> {
    pub fn new(
        reference: &'a CanonicalReference,
        epitope_positions: &'a [i32],
        overlap_threshold: f64,
    ) -> Self {
        Self {
            reference,
            epitope_positions,
            overlap_threshold,
        }
    }

    /// Map the canonical epitope into the predicted sequence's numbering.
    ///
    /// Walks the alignment's matched columns to build canonical-number →
    /// predicted-position entries; gap columns on either side contribute
    /// nothing.
    pub fn map_epitope(&self, predicted_seq: &str) -> EpitopeMapping {
        let columns = global_align(&self.reference.seq, predicted_seq.as_bytes());

        let mut position_map: BTreeMap<i32, usize> = BTreeMap::new();
        for (ref_idx, pred_idx) in columns {
            if let (Some(r), Some(p)) = (ref_idx, pred_idx) {
                // Predicted numbering is 1-indexed and gap-free.
                position_map.insert(self.reference.numbering[r], p + 1);
            }
        }

        let mut mapped = BTreeSet::new();
        let mut dropped = Vec::new();
        for &pos in self.epitope_positions {
            match position_map.get(&pos) {
                Some(&pred) => {
                    mapped.insert(pred);
                }
                None => dropped.push(pos),
            }
        }

        EpitopeMapping { mapped, dropped }
    }

    /// Overlap fraction and binary classification for one candidate.
    ///
    /// An empty mapped epitope set is an alignment failure: the call is
    /// `Unknown`, never guessed toward known-like or novel.
    pub fn classify(&self, predicted_seq: &str, contacts: &[usize]) -> EpitopeCall {
        let mapping = self.map_epitope(predicted_seq);

        if mapping.mapped.is_empty() {
            log::warn!(
                "epitope mapping empty ({} positions dropped); classification unknown",
                mapping.dropped.len()
            );
            return EpitopeCall {
                class: EpitopeClass::Unknown,
                overlap: 0.0,
                dropped_positions: mapping.dropped,
            };
        }

        let contact_set: BTreeSet<usize> = contacts.iter().copied().collect();
        let hits = mapping.mapped.intersection(&contact_set).count();
        let overlap = hits as f64 / mapping.mapped.len() as f64;

        let class = if overlap >= self.overlap_threshold {
            EpitopeClass::KnownLike
        } else {
            EpitopeClass::Novel
        };

        EpitopeCall {
            class,
            overlap,
            dropped_positions: mapping.dropped,
        }
    }
}
