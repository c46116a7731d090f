use ndarray::{Array1, Array2, ArrayView1};
use std::marker::{Send, Sync};
use std::error::Error;

/// Batched n-gram language model over integer labels.
///
/// States are opaque ids, one per (lane, beam slot) row. `advance` returns,
/// for every state row, the log-probability of each non-blank label and the
/// state id reached by consuming it, so the search can pick next states by a
/// plain gather without touching the model again.
pub trait NGramLanguageModel {
    /// Label vocabulary scored by the model (blank excluded).
    fn vocab_size(&self) -> usize;

    fn init_states(&self, rows: usize, bos: bool) -> Array1<usize>;

    fn advance(
        &mut self,
        states: ArrayView1<usize>,
    ) -> Result<(Array2<f32>, Array2<usize>), Box<dyn Error + Send + Sync>>;
}
