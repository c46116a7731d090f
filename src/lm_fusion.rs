use super::DecodeError;
use crate::fast_math;
use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayViewMut1};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruningMode {
    Early, // top-k on acoustic scores alone, LM added to the survivors only
    Late,  // fuse the full distribution before top-k
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlankScoreMode {
    NoScore,                  // LM leaves the blank score untouched
    LmWeightedFull,           // blank scaled by 1+alpha, non-blank renormalized by 1-p_blank
    LmWeighted,               // blank scaled by 1+alpha, plain LM add on non-blank
    LmWeightedFullFixedBlank, // renormalization term unweighted, blank untouched
    PreserveBlank,            // blank re-enters the beam if it made the acoustic top-k
    LmMax,                    // blank gets the best LM score of the row
    LmTopMax,                 // blank gets the best LM score among surviving labels
}

// closed set of implemented combinations; anything else never constructs
#[derive(Debug)]
enum FusionKind {
    LateNoScore,
    LateWeighted,
    LateWeightedFull,
    LateWeightedFullFixedBlank,
    LateMax,
    LateTopMax,
    LatePreserveBlank,
    EarlyNoScore,
    EarlyWeightedFull,
}

fn resolve(pruning: PruningMode, blank_mode: BlankScoreMode) -> Option<FusionKind> {
    match (pruning, blank_mode) {
        (PruningMode::Late, BlankScoreMode::NoScore) => Some(FusionKind::LateNoScore),
        (PruningMode::Late, BlankScoreMode::LmWeighted) => Some(FusionKind::LateWeighted),
        (PruningMode::Late, BlankScoreMode::LmWeightedFull) => Some(FusionKind::LateWeightedFull),
        (PruningMode::Late, BlankScoreMode::LmWeightedFullFixedBlank) => {
            Some(FusionKind::LateWeightedFullFixedBlank)
        }
        (PruningMode::Late, BlankScoreMode::LmMax) => Some(FusionKind::LateMax),
        (PruningMode::Late, BlankScoreMode::LmTopMax) => Some(FusionKind::LateTopMax),
        (PruningMode::Late, BlankScoreMode::PreserveBlank) => Some(FusionKind::LatePreserveBlank),
        (PruningMode::Early, BlankScoreMode::NoScore) => Some(FusionKind::EarlyNoScore),
        (PruningMode::Early, BlankScoreMode::LmWeightedFull) => Some(FusionKind::EarlyWeightedFull),
        _ => None,
    }
}

/// Reusable sort/gather buffers for the per-row top-k selection.
pub struct FusionScratch {
    sort: Vec<(f32, i32)>,
    picked: Vec<i32>,
}

impl FusionScratch {
    pub fn new(capacity: usize) -> Self {
        FusionScratch {
            sort: Vec::with_capacity(capacity),
            picked: Vec::with_capacity(capacity),
        }
    }
}

// top-k of one row: descending score, ascending index on ties, so selection
// order is a total order and decode results are reproducible
pub(crate) fn stable_topk_row(
    row: ArrayView1<f32>,
    k: usize,
    sort: &mut Vec<(f32, i32)>,
    mut out_scores: ArrayViewMut1<f32>,
    mut out_labels: ArrayViewMut1<i32>,
) {
    debug_assert!(k <= row.len());
    sort.clear();
    for (i, &v) in row.iter().enumerate() {
        sort.push((v, i as i32));
    }
    sort.sort_unstable_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    for j in 0..k {
        out_scores[j] = sort[j].0;
        out_labels[j] = sort[j].1;
    }
}

/// Combines acoustic and LM log-probabilities and selects the per-slot top-k
/// continuations. The pruning × blank-mode combination is resolved here once;
/// unimplemented pairs are rejected instead of silently falling back.
#[derive(Debug)]
pub struct LMFusionAdapter {
    kind: FusionKind,
    alpha: f32,
}

impl LMFusionAdapter {
    pub fn new(
        pruning: PruningMode,
        blank_mode: BlankScoreMode,
        alpha: f32,
    ) -> Result<Self, DecodeError> {
        match resolve(pruning, blank_mode) {
            Some(kind) => Ok(LMFusionAdapter { kind, alpha }),
            None => Err(DecodeError::UnsupportedLmFusion(format!(
                "pruning mode {:?} with blank score mode {:?} is not implemented",
                pruning, blank_mode
            ))),
        }
    }

    /// Fuse and select the `k` best continuations per row.
    ///
    /// `log_probs` is `[rows, vocab + 1]` with blank last and is consumed as
    /// scratch (late modes fuse in place). `lm_scores` is `[rows, vocab]`,
    /// already multiplied by the fusion weight.
    pub fn fuse_and_topk(
        &self,
        log_probs: &mut Array2<f32>,
        lm_scores: ArrayView2<f32>,
        k: usize,
        scratch: &mut FusionScratch,
        out_scores: &mut Array2<f32>,
        out_labels: &mut Array2<i32>,
    ) {
        let vocab = lm_scores.ncols();
        debug_assert_eq!(log_probs.ncols(), vocab + 1);
        for r in 0..log_probs.nrows() {
            let mut row = log_probs.row_mut(r);
            let lm = lm_scores.row(r);
            let blank_lp = row[vocab];
            match self.kind {
                FusionKind::LateNoScore => {
                    for v in 0..vocab {
                        row[v] += lm[v];
                    }
                }
                FusionKind::LateWeighted => {
                    for v in 0..vocab {
                        row[v] += lm[v];
                    }
                    row[vocab] = blank_lp * (1.0 + self.alpha);
                }
                FusionKind::LateWeightedFull => {
                    let non_blank_lp = non_blank_log_prob(blank_lp);
                    for v in 0..vocab {
                        row[v] += non_blank_lp * self.alpha + lm[v];
                    }
                    row[vocab] = blank_lp * (1.0 + self.alpha);
                }
                FusionKind::LateWeightedFullFixedBlank => {
                    let non_blank_lp = non_blank_log_prob(blank_lp);
                    for v in 0..vocab {
                        row[v] += non_blank_lp + lm[v];
                    }
                }
                FusionKind::LateMax => {
                    let mut best = f32::NEG_INFINITY;
                    for v in 0..vocab {
                        if lm[v] > best {
                            best = lm[v];
                        }
                        row[v] += lm[v];
                    }
                    row[vocab] = blank_lp + best;
                }
                FusionKind::LateTopMax => {
                    for v in 0..vocab {
                        row[v] += lm[v];
                    }
                    // blank competes against the best LM mass actually in the beam
                    topk_labels(row.slice(s![..vocab]), k, &mut scratch.sort, &mut scratch.picked);
                    let mut best = f32::NEG_INFINITY;
                    for &label in scratch.picked.iter() {
                        if lm[label as usize] > best {
                            best = lm[label as usize];
                        }
                    }
                    row[vocab] = blank_lp + best;
                }
                FusionKind::LatePreserveBlank => {
                    topk_labels(row.view(), k, &mut scratch.sort, &mut scratch.picked);
                    let had_blank = scratch.picked.iter().any(|&l| l as usize == vocab);
                    for v in 0..vocab {
                        row[v] += lm[v];
                    }
                    stable_topk_row(
                        row.slice(s![..vocab]),
                        k,
                        &mut scratch.sort,
                        out_scores.row_mut(r),
                        out_labels.row_mut(r),
                    );
                    if had_blank {
                        out_labels[[r, k - 1]] = vocab as i32;
                        out_scores[[r, k - 1]] = blank_lp;
                    }
                    continue;
                }
                FusionKind::EarlyNoScore => {
                    stable_topk_row(
                        row.view(),
                        k,
                        &mut scratch.sort,
                        out_scores.row_mut(r),
                        out_labels.row_mut(r),
                    );
                    for j in 0..k {
                        let label = out_labels[[r, j]] as usize;
                        if label != vocab {
                            out_scores[[r, j]] += lm[label];
                        }
                    }
                    continue;
                }
                FusionKind::EarlyWeightedFull => {
                    stable_topk_row(
                        row.view(),
                        k,
                        &mut scratch.sort,
                        out_scores.row_mut(r),
                        out_labels.row_mut(r),
                    );
                    let non_blank_lp = non_blank_log_prob(blank_lp);
                    for j in 0..k {
                        let label = out_labels[[r, j]] as usize;
                        if label == vocab {
                            out_scores[[r, j]] = blank_lp * (1.0 + self.alpha);
                        } else {
                            out_scores[[r, j]] += non_blank_lp * self.alpha + lm[label];
                        }
                    }
                    continue;
                }
            }
            stable_topk_row(
                row.view(),
                k,
                &mut scratch.sort,
                out_scores.row_mut(r),
                out_labels.row_mut(r),
            );
        }
    }
}

// log(1 - p_blank), with p_blank clamped away from 1
fn non_blank_log_prob(blank_lp: f32) -> f32 {
    (-fast_math::fast_exp(blank_lp).min(1.0 - 1e-6)).ln_1p()
}

fn topk_labels(row: ArrayView1<f32>, k: usize, sort: &mut Vec<(f32, i32)>, picked: &mut Vec<i32>) {
    sort.clear();
    for (i, &v) in row.iter().enumerate() {
        sort.push((v, i as i32));
    }
    sort.sort_unstable_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    picked.clear();
    for j in 0..k.min(sort.len()) {
        picked.push(sort[j].1);
    }
}
