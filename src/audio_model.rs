use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3};
use std::marker::{Send, Sync};
use std::error::Error;

/// Joint network of a transducer, split so each projection runs exactly once:
/// the encoder output is projected up front for the whole utterance batch,
/// each decoder output right after prediction, and the joint itself only
/// combines already-projected rows.
pub trait AcousticStepModel {
    fn project_encoder(
        &mut self,
        encoder_output: ArrayView3<f32>,
    ) -> Result<Array3<f32>, Box<dyn Error + Send + Sync>>;

    fn project_prednet(
        &mut self,
        decoder_output: ArrayView2<f32>,
    ) -> Result<Array2<f32>, Box<dyn Error + Send + Sync>>;

    /// Combine one projected encoder frame with one projected decoder output
    /// per row. Returns unnormalized logits over `vocab + 1`, blank last.
    fn joint_after_projection(
        &mut self,
        encoder_rows: ArrayView2<f32>,
        decoder_rows: ArrayView2<f32>,
    ) -> Result<Array2<f32>, Box<dyn Error + Send + Sync>>;
}

/// Prediction network ("decoder") of a transducer. State holds one row per
/// (lane, beam slot) pair; the search gathers rows along winning parents and
/// partially restores them where the winning label was blank.
pub trait LabelPredictor {
    type State: Clone;

    fn initial_state(&mut self, rows: usize) -> Self::State;

    /// One step: consume one label per row. `None` for the state means
    /// "start from the initial state".
    fn predict(
        &mut self,
        labels: ArrayView1<i32>,
        state: Option<&Self::State>,
    ) -> Result<(Array2<f32>, Self::State), Box<dyn Error + Send + Sync>>;

    /// Reorder state rows: row `i` of the result is row `parent_rows[i]` of
    /// `state`.
    fn gather_state(&self, state: &Self::State, parent_rows: &[usize]) -> Self::State;

    /// Overwrite `dst` rows with the matching `src` rows where `mask` is true.
    fn replace_state_rows(&self, dst: &mut Self::State, src: &Self::State, mask: &[bool]);
}
