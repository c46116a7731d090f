use super::DecodeError;
use crate::fast_math;
use ndarray::{s, Array2, Array3, ArrayView2};
use std::cmp::Ordering;

const HASH_MULT: u64 = 6364136223846793005;

/// Sentinel for "no label" / "no parent" entries in the flat trees.
pub const NO_LABEL: i32 = -1;
const NO_PARENT: i32 = -1;

/// Rolling polynomial hash over the emitted non-blank labels, mod 2^64.
#[inline]
pub fn transcript_hash_append(hash: u64, label: i32) -> u64 {
    debug_assert!(label >= 0);
    hash.wrapping_mul(HASH_MULT).wrapping_add(label as u64 + 1)
}

/// One decoded hypothesis: emitted labels, the encoder frame each label was
/// emitted at, and the raw cumulative log-probability.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    pub score: f32,
    pub labels: Vec<i32>,
    pub timestamps: Vec<usize>,
}

// snapshot of the per-slot columns of one lane, read before they are rewritten
struct RowSnapshot {
    scores: Vec<f32>,
    lengths_nb: Vec<usize>,
    lasts: Vec<usize>,
    last_label: Vec<i32>,
    hash: Vec<u64>,
}

impl RowSnapshot {
    fn new(beam_size: usize) -> Self {
        RowSnapshot {
            scores: vec![0.; beam_size],
            lengths_nb: vec![0; beam_size],
            lasts: vec![0; beam_size],
            last_label: vec![0; beam_size],
            hash: vec![0; beam_size],
        }
    }
}

/// Flat storage for every beam candidate of every lane.
///
/// Label sequences live in `[batch, beam, capacity]` trees: column `t` holds
/// the symbol each slot appended at step `t` together with the slot index it
/// extended (its parent), so a candidate's full sequence is recovered by
/// walking parents backward from the last column. Scores, non-blank lengths,
/// last labels and rolling transcript hashes are kept per slot and stay
/// consistent with that path.
pub struct BatchedBeamHyps {
    batch_size: usize,
    beam_size: usize,
    blank_index: i32,
    capacity: usize,
    // columns filled so far; every slot's total length, blanks included
    step: usize,
    scores: Array2<f32>,
    lengths_nb: Array2<usize>,
    last_label: Array2<i32>,
    last_timestep_lasts: Array2<usize>,
    transcript_hash: Array2<u64>,
    label_tree: Array3<i32>,
    parent_tree: Array3<i32>,
    prev: RowSnapshot,
    class_scratch: Vec<f32>,
    merged_scratch: Vec<f32>,
}

impl BatchedBeamHyps {
    pub fn new(
        batch_size: usize,
        beam_size: usize,
        blank_index: usize,
        initial_capacity: usize,
    ) -> Result<Self, DecodeError> {
        if batch_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "batch_size must be >= 1".to_string(),
            ));
        }
        if beam_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "beam_size must be >= 1".to_string(),
            ));
        }
        if initial_capacity == 0 {
            return Err(DecodeError::InvalidConfig(
                "initial_capacity must be >= 1".to_string(),
            ));
        }

        // one live seed hypothesis per lane, at slot 0
        let mut scores = Array2::from_elem((batch_size, beam_size), f32::NEG_INFINITY);
        scores.column_mut(0).fill(0.0);

        Ok(BatchedBeamHyps {
            batch_size,
            beam_size,
            blank_index: blank_index as i32,
            capacity: initial_capacity,
            step: 0,
            scores,
            lengths_nb: Array2::zeros((batch_size, beam_size)),
            last_label: Array2::from_elem((batch_size, beam_size), NO_LABEL),
            last_timestep_lasts: Array2::zeros((batch_size, beam_size)),
            transcript_hash: Array2::zeros((batch_size, beam_size)),
            label_tree: Array3::from_elem((batch_size, beam_size, initial_capacity), NO_LABEL),
            parent_tree: Array3::from_elem((batch_size, beam_size, initial_capacity), NO_PARENT),
            prev: RowSnapshot::new(beam_size),
            class_scratch: Vec::with_capacity(beam_size),
            merged_scratch: vec![0.; beam_size],
        })
    }

    /// Reset to the seed state without shrinking the allocation, so one store
    /// can be reused across decode calls.
    pub fn clear(&mut self) {
        self.step = 0;
        self.scores.fill(f32::NEG_INFINITY);
        self.scores.column_mut(0).fill(0.0);
        self.lengths_nb.fill(0);
        self.last_label.fill(NO_LABEL);
        self.last_timestep_lasts.fill(0);
        self.transcript_hash.fill(0);
        self.label_tree.fill(NO_LABEL);
        self.parent_tree.fill(NO_PARENT);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total steps taken (uniform across slots: every slot commits one symbol
    /// per step, a sentinel if it only rode through).
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn scores(&self) -> ArrayView2<f32> {
        self.scores.view()
    }

    /// Consecutive non-blank emissions of each slot at its current frame.
    pub fn last_timestep_lasts(&self) -> ArrayView2<usize> {
        self.last_timestep_lasts.view()
    }

    /// Frame index each slot sits at: total steps minus non-blank steps.
    #[inline]
    pub fn next_timestep(&self, b: usize, k: usize) -> usize {
        self.step - self.lengths_nb[[b, k]]
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity * 2;
        let mut label_tree =
            Array3::from_elem((self.batch_size, self.beam_size, new_capacity), NO_LABEL);
        let mut parent_tree =
            Array3::from_elem((self.batch_size, self.beam_size, new_capacity), NO_PARENT);
        label_tree
            .slice_mut(s![.., .., ..self.capacity])
            .assign(&self.label_tree);
        parent_tree
            .slice_mut(s![.., .., ..self.capacity])
            .assign(&self.parent_tree);
        self.label_tree = label_tree;
        self.parent_tree = parent_tree;
        self.capacity = new_capacity;
    }

    /// Commit one step, growing the trees by doubling if the next column
    /// would not fit.
    pub fn add_results(
        &mut self,
        parents: ArrayView2<usize>,
        labels: ArrayView2<i32>,
        next_scores: ArrayView2<f32>,
    ) {
        while self.step + 1 >= self.capacity {
            self.grow();
        }
        self.add_results_unchecked(parents, labels, next_scores);
    }

    /// Commit one step assuming the column fits (capacity was provisioned).
    ///
    /// For each output slot: `parents` names the slot it extends, `labels`
    /// the chosen symbol (blank, a real label, or -1 for a terminated
    /// candidate riding through), `next_scores` the resulting score. Score,
    /// last label, hash and lengths derive from the parent slot's values;
    /// score is taken from `next_scores` only where the slot was extended.
    pub fn add_results_unchecked(
        &mut self,
        parents: ArrayView2<usize>,
        labels: ArrayView2<i32>,
        next_scores: ArrayView2<f32>,
    ) {
        debug_assert!(self.step < self.capacity);
        let col = self.step;
        for b in 0..self.batch_size {
            for k in 0..self.beam_size {
                self.prev.scores[k] = self.scores[[b, k]];
                self.prev.lengths_nb[k] = self.lengths_nb[[b, k]];
                self.prev.lasts[k] = self.last_timestep_lasts[[b, k]];
                self.prev.last_label[k] = self.last_label[[b, k]];
                self.prev.hash[k] = self.transcript_hash[[b, k]];
            }
            for k in 0..self.beam_size {
                let src = parents[[b, k]];
                let label = labels[[b, k]];
                debug_assert!(src < self.beam_size);
                self.label_tree[[b, k, col]] = label;
                self.parent_tree[[b, k, col]] = src as i32;

                let is_blank = label == self.blank_index;
                let is_label = label >= 0 && !is_blank;
                self.lengths_nb[[b, k]] = self.prev.lengths_nb[src] + is_label as usize;
                self.scores[[b, k]] = if label >= 0 {
                    next_scores[[b, k]]
                } else {
                    self.prev.scores[src]
                };
                self.last_timestep_lasts[[b, k]] = if is_blank {
                    0
                } else {
                    self.prev.lasts[src] + is_label as usize
                };
                self.last_label[[b, k]] = if is_label {
                    label
                } else {
                    self.prev.last_label[src]
                };
                self.transcript_hash[[b, k]] = if is_label {
                    transcript_hash_append(self.prev.hash[src], label)
                } else {
                    self.prev.hash[src]
                };
            }
        }
        self.step += 1;
    }

    /// Merge slots carrying the same emitted sequence.
    ///
    /// Two slots of a lane are equivalent when transcript hash, last label
    /// and non-blank length all match. The best-scoring slot of each class
    /// (first on ties) survives with the log-sum-exp of the class; the rest
    /// drop to -inf.
    pub fn recombine(&mut self) {
        if self.beam_size <= 1 {
            return;
        }
        for b in 0..self.batch_size {
            for j in 0..self.beam_size {
                self.class_scratch.clear();
                let mut max = f32::NEG_INFINITY;
                let mut argmax = 0;
                for k in 0..self.beam_size {
                    let equal = self.transcript_hash[[b, j]] == self.transcript_hash[[b, k]]
                        && self.last_label[[b, j]] == self.last_label[[b, k]]
                        && self.lengths_nb[[b, j]] == self.lengths_nb[[b, k]];
                    if !equal {
                        continue;
                    }
                    let score = self.scores[[b, k]];
                    self.class_scratch.push(score);
                    if score > max {
                        max = score;
                        argmax = k;
                    }
                }
                self.merged_scratch[j] = if max > f32::NEG_INFINITY && argmax == j {
                    fast_math::logsumexp(&self.class_scratch, max)
                } else {
                    f32::NEG_INFINITY
                };
            }
            for j in 0..self.beam_size {
                self.scores[[b, j]] = self.merged_scratch[j];
            }
        }
    }

    // walk parents backward from `slot`'s last column, then replay forward:
    // blanks advance the frame counter, real labels are emitted at it
    fn rebuild(&self, b: usize, slot: usize) -> (Vec<i32>, Vec<usize>) {
        let mut symbols = vec![NO_LABEL; self.step];
        let mut k = slot;
        for t in (0..self.step).rev() {
            symbols[t] = self.label_tree[[b, k, t]];
            let parent = self.parent_tree[[b, k, t]];
            debug_assert!(parent >= 0);
            k = parent as usize;
        }

        let mut labels = Vec::new();
        let mut timestamps = Vec::new();
        let mut frame = 0usize;
        for &sym in &symbols {
            if sym == self.blank_index {
                frame += 1;
            } else if sym >= 0 {
                labels.push(sym);
                timestamps.push(frame);
            }
        }
        (labels, timestamps)
    }

    // slot indices of one lane, best first; stable on ties
    fn ranked_slots(&self, b: usize, score_norm: bool) -> Vec<usize> {
        let ranking: Vec<f32> = (0..self.beam_size)
            .map(|k| {
                let score = self.scores[[b, k]];
                if score_norm {
                    score / (self.lengths_nb[[b, k]] + 1) as f32
                } else {
                    score
                }
            })
            .collect();
        let perm =
            permutation::sort_by(&ranking[..], |a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let slots: Vec<usize> = (0..self.beam_size).collect();
        perm.apply_slice(&slots[..])
    }

    /// Best hypothesis of every lane, ranked by score (optionally normalized
    /// by emitted length + 1). Returned scores are always the raw ones.
    pub fn to_best_hypothesis_per_lane(&self, score_norm: bool) -> Vec<Hypothesis> {
        (0..self.batch_size)
            .map(|b| {
                let slot = self.ranked_slots(b, score_norm)[0];
                let (labels, timestamps) = self.rebuild(b, slot);
                Hypothesis {
                    score: self.scores[[b, slot]],
                    labels,
                    timestamps,
                }
            })
            .collect()
    }

    /// All live hypotheses of every lane, best first. Slots at -inf (pruned
    /// or recombined away) are dropped.
    pub fn to_nbest_per_lane(&self, score_norm: bool) -> Vec<Vec<Hypothesis>> {
        (0..self.batch_size)
            .map(|b| {
                self.ranked_slots(b, score_norm)
                    .into_iter()
                    .filter(|&k| self.scores[[b, k]] > f32::NEG_INFINITY)
                    .map(|k| {
                        let (labels, timestamps) = self.rebuild(b, k);
                        Hypothesis {
                            score: self.scores[[b, k]],
                            labels,
                            timestamps,
                        }
                    })
                    .collect()
            })
            .collect()
    }
}
