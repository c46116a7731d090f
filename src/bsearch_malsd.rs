use super::DecodeError;
use crate::audio_model::{AcousticStepModel, LabelPredictor};
use crate::beam_hyps::{BatchedBeamHyps, Hypothesis, NO_LABEL};
use crate::fast_math;
use crate::graph_exec::{
    CapturedProgram, DevicePlatform, ExecutionMode, FullGraph, SeparateGraphs, Stage,
    INITIAL_MAX_TIME,
};
use crate::language_model::NGramLanguageModel;
use crate::lm_fusion::{
    stable_topk_row, BlankScoreMode, FusionScratch, LMFusionAdapter, PruningMode,
};
use log::{debug, warn};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView3};
use std::cmp::Ordering;

/// Settings of the batched label-synchronous beam search.
#[derive(Clone, Copy, Debug)]
pub struct MalsdBeamConfig {
    /// Hypotheses kept per lane.
    pub beam_size: usize,
    /// Index of the blank class, which must equal the vocabulary size
    /// (blank is the last joint output and doubles as the start symbol).
    pub blank_index: usize,
    /// Bound on consecutive non-blank emissions per frame; `None` removes
    /// the bound and with it the termination guarantee.
    pub max_symbols_per_step: Option<usize>,
    /// Weight applied to language model scores.
    pub ngram_lm_alpha: f32,
    pub pruning_mode: PruningMode,
    pub blank_lm_score_mode: BlankScoreMode,
    /// Merge slots that carry the same label sequence.
    pub allow_recombination: bool,
    /// Rank final hypotheses by score divided by length.
    pub score_norm: bool,
    /// Allow captured decode programs when the platform supports them.
    pub allow_graphs: bool,
}

impl Default for MalsdBeamConfig {
    fn default() -> Self {
        MalsdBeamConfig {
            beam_size: 4,
            blank_index: 0,
            max_symbols_per_step: Some(10),
            ngram_lm_alpha: 0.0,
            pruning_mode: PruningMode::Early,
            blank_lm_score_mode: BlankScoreMode::LmWeightedFull,
            allow_recombination: true,
            score_norm: true,
            allow_graphs: true,
        }
    }
}

// per-step scratch, sized once at reinit
struct StepBuffers {
    enc_rows: Array2<f32>,         // [(B·K), enc_dim]
    logits: Array2<f32>,           // [(B·K), V+1]
    topk_scores: Array2<f32>,      // [(B·K), K]
    topk_labels: Array2<i32>,      // [(B·K), K]
    candidates: Array2<f32>,       // [B, K·K]
    candidate_labels: Array2<i32>, // [B, K·K]
    parents: Array2<usize>,        // [B, K]
    next_labels: Array2<i32>,      // [B, K]
    next_scores: Array2<f32>,      // [B, K]
    fed_labels: Array1<i32>,       // [(B·K)]
    preserve: Vec<bool>,           // [(B·K)]
    parent_rows: Vec<usize>,       // [(B·K)]
    sort: Vec<(f32, i32)>,
    fusion: FusionScratch,
}

// everything a decode step reads or writes; owned by the decoder and reused
// across calls until a larger batch or utterance forces a reallocation
struct DecodeState<S> {
    batch_size: usize,
    max_time: usize,
    current_batch: usize,
    encoder_projected: Array3<f32>,
    encoder_len: Array1<usize>,
    hyps: BatchedBeamHyps,
    last_timesteps: Array2<i64>,
    time_indices: Array2<i64>,
    safe_time_indices: Array2<usize>,
    active_mask: Array2<bool>,
    active_any: bool,
    decoder_output: Array2<f32>,
    prev_decoder_output: Array2<f32>,
    decoder_state: S,
    lm_states: Array1<usize>,
    lm_states_prev: Array1<usize>,
    lm_candidates: Array2<usize>,
    lm_candidates_prev: Array2<usize>,
    lm_scores: Array2<f32>,
    bufs: StepBuffers,
}

fn missing_state() -> DecodeError {
    DecodeError::InvalidConfig("decode state is not initialized".to_string())
}

/// Batched modified-ALSD beam search over a transducer.
///
/// Label-synchronous: every step extends all beam slots of all lanes by one
/// label (or a forced/ride-through blank), so slot histories stay equal in
/// length and live in flat per-step storage. The same staged step code runs
/// eagerly or as recorded programs, selected by the execution mode.
pub struct BatchedMalsdDecoder<P: LabelPredictor, J: AcousticStepModel> {
    predictor: P,
    joint: J,
    lm: Option<Box<dyn NGramLanguageModel>>,
    fusion: Option<LMFusionAdapter>,
    config: MalsdBeamConfig,
    max_symbols: Option<usize>,
    mode: ExecutionMode,
    platform: DevicePlatform,
    state: Option<DecodeState<P::State>>,
    separate_graphs: Option<SeparateGraphs<Self>>,
    full_graph: Option<FullGraph<Self>>,
    reinit_count: usize,
}

impl<P: LabelPredictor, J: AcousticStepModel> BatchedMalsdDecoder<P, J> {
    pub fn new(
        predictor: P,
        joint: J,
        ngram_lm: Option<Box<dyn NGramLanguageModel>>,
        config: MalsdBeamConfig,
        platform: DevicePlatform,
    ) -> Result<Self, DecodeError> {
        if config.beam_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "beam_size must be >= 1".to_string(),
            ));
        }
        if config.blank_index == 0 {
            return Err(DecodeError::InvalidConfig(
                "blank_index must equal the vocabulary size, which must be >= 1".to_string(),
            ));
        }
        if config.beam_size > config.blank_index + 1 {
            return Err(DecodeError::InvalidConfig(format!(
                "beam_size {} exceeds the {} joint output classes",
                config.beam_size,
                config.blank_index + 1
            )));
        }
        if let Some(max_symbols) = config.max_symbols_per_step {
            if max_symbols == 0 {
                return Err(DecodeError::InvalidConfig(
                    "max_symbols_per_step must be >= 1 when set".to_string(),
                ));
            }
        }
        let fusion = match &ngram_lm {
            Some(lm) => {
                if lm.vocab_size() != config.blank_index {
                    return Err(DecodeError::InvalidConfig(format!(
                        "language model scores {} labels but the blank index is {}",
                        lm.vocab_size(),
                        config.blank_index
                    )));
                }
                if config.beam_size > config.blank_index {
                    return Err(DecodeError::InvalidConfig(format!(
                        "beam_size {} exceeds the {} non-blank labels available for fused pruning",
                        config.beam_size, config.blank_index
                    )));
                }
                Some(LMFusionAdapter::new(
                    config.pruning_mode,
                    config.blank_lm_score_mode,
                    config.ngram_lm_alpha,
                )?)
            }
            None => None,
        };

        let mut decoder = BatchedMalsdDecoder {
            predictor,
            joint,
            lm: ngram_lm,
            fusion,
            config,
            max_symbols: config.max_symbols_per_step,
            mode: ExecutionMode::Eager,
            platform,
            state: None,
            separate_graphs: None,
            full_graph: None,
            reinit_count: 0,
        };
        decoder.maybe_enable_graphs();
        Ok(decoder)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Enable captured decode programs if the configuration and platform
    /// allow them. Falls back with a warning instead of failing.
    pub fn maybe_enable_graphs(&mut self) {
        if self.mode != ExecutionMode::Eager {
            return;
        }
        if self.config.allow_graphs {
            if self.max_symbols.is_none() {
                warn!("max symbols per step is not set, which is not allowed with captured decode programs; setting it to 10");
                self.max_symbols = Some(10);
            }
            if self.platform.supports_conditional_nodes {
                self.mode = ExecutionMode::FullGraph;
            } else {
                warn!("conditional capture is not supported on this platform; the decode loop is replayed stepwise and decoding will be slower");
                self.mode = ExecutionMode::PartialGraphs;
            }
        }
        self.reset_graph_state();
    }

    /// Pin the execution mode, discarding any captured state.
    pub fn force_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.reset_graph_state();
    }

    /// Drop back to eager stepping, releasing captured programs and buffers.
    pub fn disable_graphs(&mut self) {
        if self.mode == ExecutionMode::Eager {
            return;
        }
        self.mode = ExecutionMode::Eager;
        self.reset_graph_state();
    }

    pub fn reset_graph_state(&mut self) {
        self.state = None;
        self.separate_graphs = None;
        self.full_graph = None;
    }

    /// Best hypothesis per lane.
    pub fn decode(
        &mut self,
        encoder_output: ArrayView3<f32>,
        encoder_lengths: ArrayView1<usize>,
    ) -> Result<Vec<Hypothesis>, DecodeError> {
        self.run_decode(encoder_output, encoder_lengths)?;
        let state = match self.state.as_ref() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let mut hyps = state.hyps.to_best_hypothesis_per_lane(self.config.score_norm);
        hyps.truncate(state.current_batch);
        Ok(hyps)
    }

    /// All surviving hypotheses per lane, best first.
    pub fn decode_nbest(
        &mut self,
        encoder_output: ArrayView3<f32>,
        encoder_lengths: ArrayView1<usize>,
    ) -> Result<Vec<Vec<Hypothesis>>, DecodeError> {
        self.run_decode(encoder_output, encoder_lengths)?;
        let state = match self.state.as_ref() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let mut hyps = state.hyps.to_nbest_per_lane(self.config.score_norm);
        hyps.truncate(state.current_batch);
        Ok(hyps)
    }

    fn run_decode(
        &mut self,
        encoder_output: ArrayView3<f32>,
        encoder_lengths: ArrayView1<usize>,
    ) -> Result<(), DecodeError> {
        let (batch_size, max_time, _) = encoder_output.dim();
        if batch_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "encoder output must hold at least one lane".to_string(),
            ));
        }
        if encoder_lengths.len() != batch_size {
            return Err(DecodeError::ShapeMismatch(format!(
                "got {} encoder lengths for {} lanes",
                encoder_lengths.len(),
                batch_size
            )));
        }
        for (b, &len) in encoder_lengths.iter().enumerate() {
            if len > max_time {
                return Err(DecodeError::ShapeMismatch(format!(
                    "lane {} claims {} frames but the encoder output holds {}",
                    b, len, max_time
                )));
            }
        }

        // project once for the whole call
        let projected = self
            .joint
            .project_encoder(encoder_output)
            .map_err(DecodeError::Model)?;
        if projected.shape()[0] != batch_size || projected.shape()[1] != max_time {
            return Err(DecodeError::ShapeMismatch(format!(
                "encoder projection changed the batch or time shape: {:?}",
                projected.shape()
            )));
        }

        if self.need_reinit(batch_size, max_time) {
            self.reinitialize(batch_size, max_time, projected.shape()[2])?;
        }

        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        if state.encoder_projected.shape()[2] != projected.shape()[2] {
            return Err(DecodeError::ShapeMismatch(format!(
                "encoder projection width changed from {} to {}",
                state.encoder_projected.shape()[2],
                projected.shape()[2]
            )));
        }
        state.current_batch = batch_size;
        state.encoder_len.fill(0);
        for (b, &len) in encoder_lengths.iter().enumerate() {
            state.encoder_len[b] = len;
        }
        state
            .encoder_projected
            .slice_mut(s![..batch_size, ..max_time, ..])
            .assign(&projected);

        match self.mode {
            ExecutionMode::Eager => {
                self.eager_before_loop()?;
                while self.loop_active() {
                    self.eager_loop_body()?;
                }
                Ok(())
            }
            ExecutionMode::PartialGraphs => {
                let graphs = match self.separate_graphs.take() {
                    Some(graphs) => graphs,
                    None => return Err(missing_state()),
                };
                let outcome = (|| {
                    graphs.before_loop.replay(self)?;
                    while self.loop_active() {
                        graphs.loop_body.replay(self)?;
                    }
                    Ok(())
                })();
                self.separate_graphs = Some(graphs);
                outcome
            }
            ExecutionMode::FullGraph => {
                let graph = match self.full_graph.take() {
                    Some(graph) => graph,
                    None => return Err(missing_state()),
                };
                let outcome = graph.replay(self);
                self.full_graph = Some(graph);
                outcome
            }
        }
    }

    fn need_reinit(&self, batch_size: usize, max_time: usize) -> bool {
        match &self.state {
            None => true,
            Some(state) => state.batch_size < batch_size || state.max_time < max_time,
        }
    }

    fn reinitialize(
        &mut self,
        batch_size: usize,
        max_time: usize,
        enc_dim: usize,
    ) -> Result<(), DecodeError> {
        let max_time = max_time.max(INITIAL_MAX_TIME);
        let beam = self.config.beam_size;
        let vocab = self.config.blank_index;
        let rows = batch_size * beam;
        let capacity = match self.max_symbols {
            Some(max_symbols) => max_time * (max_symbols + 1),
            None => max_time,
        };
        let hyps = BatchedBeamHyps::new(batch_size, beam, vocab, capacity)?;

        // run the prediction network once to size its output buffers
        let sos = Array1::from_elem(rows, vocab as i32);
        let (decoder_output, _) = self
            .predictor
            .predict(sos.view(), None)
            .map_err(DecodeError::Model)?;
        let decoder_output = self
            .joint
            .project_prednet(decoder_output.view())
            .map_err(DecodeError::Model)?;
        if decoder_output.nrows() != rows {
            return Err(DecodeError::ShapeMismatch(format!(
                "prediction network produced {} rows for {} slots",
                decoder_output.nrows(),
                rows
            )));
        }
        let pred_dim = decoder_output.ncols();

        let (lm_states, lm_candidates, lm_scores) = match self.lm.as_ref() {
            Some(lm) => (
                lm.init_states(rows, true),
                Array2::zeros((rows, vocab)),
                Array2::zeros((rows, vocab)),
            ),
            None => (Array1::zeros(0), Array2::zeros((0, 0)), Array2::zeros((0, 0))),
        };
        let lm_rows = lm_states.len();
        let lm_width = lm_candidates.ncols();

        self.state = Some(DecodeState {
            batch_size,
            max_time,
            current_batch: batch_size,
            encoder_projected: Array3::zeros((batch_size, max_time, enc_dim)),
            encoder_len: Array1::zeros(batch_size),
            hyps,
            last_timesteps: Array2::zeros((batch_size, beam)),
            time_indices: Array2::zeros((batch_size, beam)),
            safe_time_indices: Array2::zeros((batch_size, beam)),
            active_mask: Array2::from_elem((batch_size, beam), false),
            active_any: false,
            decoder_output,
            prev_decoder_output: Array2::zeros((rows, pred_dim)),
            decoder_state: self.predictor.initial_state(rows),
            lm_states,
            lm_states_prev: Array1::zeros(lm_rows),
            lm_candidates,
            lm_candidates_prev: Array2::zeros((lm_rows, lm_width)),
            lm_scores,
            bufs: StepBuffers {
                enc_rows: Array2::zeros((rows, enc_dim)),
                logits: Array2::zeros((rows, vocab + 1)),
                topk_scores: Array2::zeros((rows, beam)),
                topk_labels: Array2::zeros((rows, beam)),
                candidates: Array2::zeros((batch_size, beam * beam)),
                candidate_labels: Array2::zeros((batch_size, beam * beam)),
                parents: Array2::zeros((batch_size, beam)),
                next_labels: Array2::zeros((batch_size, beam)),
                next_scores: Array2::zeros((batch_size, beam)),
                fed_labels: Array1::zeros(rows),
                preserve: vec![false; rows],
                parent_rows: vec![0; rows],
                sort: Vec::with_capacity((beam * beam).max(vocab + 1)),
                fusion: FusionScratch::new(vocab + 1),
            },
        });
        self.reinit_count += 1;
        debug!(
            "decode state reinitialized: {} lanes x {} frames, reinit #{}",
            batch_size, max_time, self.reinit_count
        );

        match self.mode {
            ExecutionMode::Eager => {}
            ExecutionMode::PartialGraphs => self.capture_separate_graphs()?,
            ExecutionMode::FullGraph => self.capture_full_graph()?,
        }
        Ok(())
    }

    fn record_before_loop(&self) -> CapturedProgram<Self> {
        let mut stages: Vec<Stage<Self>> = vec![Self::stage_reset, Self::stage_init_decoder];
        if self.lm.is_some() {
            stages.push(Self::stage_init_lm);
        }
        CapturedProgram::record(stages)
    }

    fn record_loop_body(&self) -> CapturedProgram<Self> {
        let mut stages: Vec<Stage<Self>> = vec![Self::stage_joint];
        stages.push(if self.lm.is_some() {
            Self::stage_fuse_topk
        } else {
            Self::stage_topk
        });
        stages.push(Self::stage_candidates);
        stages.push(Self::stage_prune);
        stages.push(if self.max_symbols.is_some() {
            Self::stage_store_unchecked
        } else {
            Self::stage_store_checked
        });
        if self.config.allow_recombination {
            stages.push(Self::stage_recombine);
        }
        stages.push(Self::stage_update_decoder);
        if self.lm.is_some() {
            stages.push(Self::stage_advance_lm);
        }
        stages.push(Self::stage_update_time);
        CapturedProgram::record(stages)
    }

    fn capture_separate_graphs(&mut self) -> Result<(), DecodeError> {
        let graphs = SeparateGraphs {
            before_loop: self.record_before_loop(),
            loop_body: self.record_loop_body(),
        };
        // warmup over the zeroed buffers; every lane is inactive, so the
        // body runs its full masked path once
        graphs.before_loop.replay(self)?;
        graphs.loop_body.replay(self)?;
        self.separate_graphs = Some(graphs);
        Ok(())
    }

    fn capture_full_graph(&mut self) -> Result<(), DecodeError> {
        let graph = FullGraph {
            before_loop: self.record_before_loop(),
            loop_body: self.record_loop_body(),
            condition: Self::loop_condition,
        };
        graph.before_loop.replay(self)?;
        graph.loop_body.replay(self)?;
        self.full_graph = Some(graph);
        Ok(())
    }

    fn loop_condition(decoder: &Self) -> bool {
        decoder.state.as_ref().map_or(false, |state| state.active_any)
    }

    fn loop_active(&self) -> bool {
        Self::loop_condition(self)
    }

    fn eager_before_loop(&mut self) -> Result<(), DecodeError> {
        self.stage_reset()?;
        self.stage_init_decoder()?;
        if self.lm.is_some() {
            self.stage_init_lm()?;
        }
        Ok(())
    }

    fn eager_loop_body(&mut self) -> Result<(), DecodeError> {
        self.stage_joint()?;
        if self.lm.is_some() {
            self.stage_fuse_topk()?;
        } else {
            self.stage_topk()?;
        }
        self.stage_candidates()?;
        self.stage_prune()?;
        if self.max_symbols.is_some() {
            self.stage_store_unchecked()?;
        } else {
            self.stage_store_checked()?;
        }
        if self.config.allow_recombination {
            self.stage_recombine()?;
        }
        self.stage_update_decoder()?;
        if self.lm.is_some() {
            self.stage_advance_lm()?;
        }
        self.stage_update_time()
    }

    // seed hypotheses, timing masks and the start symbol
    fn stage_reset(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        let blank = self.config.blank_index as i32;
        state.hyps.clear();
        state.bufs.fed_labels.fill(blank);
        for b in 0..state.batch_size {
            let last = state.encoder_len[b] as i64 - 1;
            for k in 0..beam {
                state.last_timesteps[[b, k]] = last;
                state.time_indices[[b, k]] = 0;
                state.safe_time_indices[[b, k]] = 0;
                state.active_mask[[b, k]] = 0 <= last;
            }
        }
        state.active_any = state.active_mask.iter().any(|&active| active);
        Ok(())
    }

    // feed the start symbol through the prediction network
    fn stage_init_decoder(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let (output, decoder_state) = self
            .predictor
            .predict(state.bufs.fed_labels.view(), None)
            .map_err(DecodeError::Model)?;
        let output = self
            .joint
            .project_prednet(output.view())
            .map_err(DecodeError::Model)?;
        if output.dim() != state.decoder_output.dim() {
            return Err(DecodeError::ShapeMismatch(format!(
                "prediction network output changed shape from {:?} to {:?}",
                state.decoder_output.dim(),
                output.dim()
            )));
        }
        state.decoder_output.assign(&output);
        state.decoder_state = decoder_state;
        Ok(())
    }

    // start-of-sentence language model states and their first scores
    fn stage_init_lm(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let lm = match self.lm.as_mut() {
            Some(lm) => lm,
            None => {
                return Err(DecodeError::InvalidConfig(
                    "language model stage scheduled without a language model".to_string(),
                ))
            }
        };
        state.lm_states.assign(&lm.init_states(state.lm_states.len(), true));
        let (scores, candidates) = lm
            .advance(state.lm_states.view())
            .map_err(DecodeError::Model)?;
        if scores.dim() != state.lm_scores.dim() {
            return Err(DecodeError::ShapeMismatch(format!(
                "language model scored {:?} but the decoder expects {:?}",
                scores.dim(),
                state.lm_scores.dim()
            )));
        }
        state.lm_scores.assign(&scores);
        state.lm_scores *= self.config.ngram_lm_alpha;
        state.lm_candidates.assign(&candidates);
        Ok(())
    }

    // joint on the frame each slot sits at, then log-softmax
    fn stage_joint(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        for b in 0..state.batch_size {
            for k in 0..beam {
                let row = b * beam + k;
                let t = state.safe_time_indices[[b, k]];
                state
                    .bufs
                    .enc_rows
                    .row_mut(row)
                    .assign(&state.encoder_projected.slice(s![b, t, ..]));
            }
        }
        let logits = self
            .joint
            .joint_after_projection(state.bufs.enc_rows.view(), state.decoder_output.view())
            .map_err(DecodeError::Model)?;
        if logits.dim() != state.bufs.logits.dim() {
            return Err(DecodeError::ShapeMismatch(format!(
                "joint produced {:?} logits but the decoder expects {:?}",
                logits.dim(),
                state.bufs.logits.dim()
            )));
        }
        state.bufs.logits = logits;
        fast_math::log_softmax_rows(&mut state.bufs.logits);
        Ok(())
    }

    fn stage_topk(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        for row in 0..state.bufs.logits.nrows() {
            stable_topk_row(
                state.bufs.logits.row(row),
                beam,
                &mut state.bufs.sort,
                state.bufs.topk_scores.row_mut(row),
                state.bufs.topk_labels.row_mut(row),
            );
        }
        Ok(())
    }

    fn stage_fuse_topk(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let fusion = match self.fusion.as_ref() {
            Some(fusion) => fusion,
            None => {
                return Err(DecodeError::InvalidConfig(
                    "fusion stage scheduled without a language model".to_string(),
                ))
            }
        };
        fusion.fuse_and_topk(
            &mut state.bufs.logits,
            state.lm_scores.view(),
            self.config.beam_size,
            &mut state.bufs.fusion,
            &mut state.bufs.topk_scores,
            &mut state.bufs.topk_labels,
        );
        Ok(())
    }

    // candidate grid per lane: K parents x K continuations, with frozen
    // slots riding through at column 0 and forced blanks replacing the
    // extensions of slots that hit the per-frame symbol bound
    fn stage_candidates(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        let vocab = self.config.blank_index;
        let blank = self.config.blank_index as i32;
        let scores = state.hyps.scores();
        let lasts = state.hyps.last_timestep_lasts();
        for b in 0..state.batch_size {
            for j in 0..beam {
                let row = b * beam + j;
                let slot_score = scores[[b, j]];
                let active = state.active_mask[[b, j]];
                let force_blank = match self.max_symbols {
                    Some(max_symbols) => active && lasts[[b, j]] >= max_symbols,
                    None => false,
                };
                let blank_lp = state.bufs.logits[[row, vocab]];
                for k in 0..beam {
                    let col = j * beam + k;
                    let (score, label) = if !active {
                        if k == 0 {
                            (slot_score, NO_LABEL)
                        } else {
                            (f32::NEG_INFINITY, NO_LABEL)
                        }
                    } else if force_blank {
                        if k == 0 {
                            (slot_score + blank_lp, blank)
                        } else {
                            (f32::NEG_INFINITY, blank)
                        }
                    } else {
                        (
                            slot_score + state.bufs.topk_scores[[row, k]],
                            state.bufs.topk_labels[[row, k]],
                        )
                    };
                    state.bufs.candidates[[b, col]] = score;
                    state.bufs.candidate_labels[[b, col]] = label;
                }
            }
        }
        Ok(())
    }

    // keep the best K of the K·K candidates per lane; ties resolve to the
    // lowest flat index so replays stay reproducible
    fn stage_prune(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        for b in 0..state.batch_size {
            let sort = &mut state.bufs.sort;
            sort.clear();
            for (i, &score) in state.bufs.candidates.row(b).iter().enumerate() {
                sort.push((score, i as i32));
            }
            sort.sort_unstable_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            for i in 0..beam {
                let (score, flat) = sort[i];
                let flat = flat as usize;
                state.bufs.parents[[b, i]] = flat / beam;
                state.bufs.next_labels[[b, i]] = state.bufs.candidate_labels[[b, flat]];
                state.bufs.next_scores[[b, i]] = score;
            }
        }
        Ok(())
    }

    fn stage_store_checked(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        state.hyps.add_results(
            state.bufs.parents.view(),
            state.bufs.next_labels.view(),
            state.bufs.next_scores.view(),
        );
        Ok(())
    }

    fn stage_store_unchecked(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        state.hyps.add_results_unchecked(
            state.bufs.parents.view(),
            state.bufs.next_labels.view(),
            state.bufs.next_scores.view(),
        );
        Ok(())
    }

    fn stage_recombine(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        state.hyps.recombine();
        Ok(())
    }

    // advance the prediction network along the winning parents; slots whose
    // winning label was blank keep the gathered previous output and state
    fn stage_update_decoder(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        let blank = self.config.blank_index as i32;
        let rows = state.batch_size * beam;
        for b in 0..state.batch_size {
            for k in 0..beam {
                let row = b * beam + k;
                let label = state.bufs.next_labels[[b, k]];
                let fed = if label >= 0 { label } else { blank };
                state.bufs.fed_labels[row] = fed;
                state.bufs.preserve[row] = fed == blank;
                state.bufs.parent_rows[row] = b * beam + state.bufs.parents[[b, k]];
            }
        }
        for row in 0..rows {
            let src = state.bufs.parent_rows[row];
            state
                .prev_decoder_output
                .row_mut(row)
                .assign(&state.decoder_output.row(src));
        }
        let prev_state = self
            .predictor
            .gather_state(&state.decoder_state, &state.bufs.parent_rows);
        let (output, new_state) = self
            .predictor
            .predict(state.bufs.fed_labels.view(), Some(&prev_state))
            .map_err(DecodeError::Model)?;
        let output = self
            .joint
            .project_prednet(output.view())
            .map_err(DecodeError::Model)?;
        if output.dim() != state.decoder_output.dim() {
            return Err(DecodeError::ShapeMismatch(format!(
                "prediction network output changed shape from {:?} to {:?}",
                state.decoder_output.dim(),
                output.dim()
            )));
        }
        state.decoder_output.assign(&output);
        for row in 0..rows {
            if state.bufs.preserve[row] {
                state
                    .decoder_output
                    .row_mut(row)
                    .assign(&state.prev_decoder_output.row(row));
            }
        }
        state.decoder_state = new_state;
        self.predictor
            .replace_state_rows(&mut state.decoder_state, &prev_state, &state.bufs.preserve);
        Ok(())
    }

    // language model mirror of the decoder update: gather candidate tables
    // along winning parents, step states on non-blank labels, re-score
    fn stage_advance_lm(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let lm = match self.lm.as_mut() {
            Some(lm) => lm,
            None => {
                return Err(DecodeError::InvalidConfig(
                    "language model stage scheduled without a language model".to_string(),
                ))
            }
        };
        let rows = state.lm_states.len();
        for row in 0..rows {
            let src = state.bufs.parent_rows[row];
            state
                .lm_candidates_prev
                .row_mut(row)
                .assign(&state.lm_candidates.row(src));
            state.lm_states_prev[row] = state.lm_states[src];
        }
        for row in 0..rows {
            state.lm_states[row] = if state.bufs.preserve[row] {
                state.lm_states_prev[row]
            } else {
                state.lm_candidates_prev[[row, state.bufs.fed_labels[row] as usize]]
            };
        }
        let (scores, candidates) = lm
            .advance(state.lm_states.view())
            .map_err(DecodeError::Model)?;
        if scores.dim() != state.lm_scores.dim() {
            return Err(DecodeError::ShapeMismatch(format!(
                "language model scored {:?} but the decoder expects {:?}",
                scores.dim(),
                state.lm_scores.dim()
            )));
        }
        state.lm_scores.assign(&scores);
        state.lm_scores *= self.config.ngram_lm_alpha;
        state.lm_candidates.assign(&candidates);
        Ok(())
    }

    // every slot of a lane shares the same step count, so its frame is the
    // step count minus its non-blank emissions
    fn stage_update_time(&mut self) -> Result<(), DecodeError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Err(missing_state()),
        };
        let beam = self.config.beam_size;
        let mut any = false;
        for b in 0..state.batch_size {
            for k in 0..beam {
                let time = state.hyps.next_timestep(b, k) as i64;
                let last = state.last_timesteps[[b, k]];
                state.time_indices[[b, k]] = time;
                state.safe_time_indices[[b, k]] = time.min(last).max(0) as usize;
                let active = time <= last;
                state.active_mask[[b, k]] = active;
                any |= active;
            }
        }
        state.active_any = any;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayView2};
    use std::error::Error;

    // prediction network with a decaying additive state, deterministic in
    // the label sequence
    struct ToyPredictor {
        dim: usize,
    }

    impl LabelPredictor for ToyPredictor {
        type State = Array2<f32>;

        fn initial_state(&mut self, rows: usize) -> Array2<f32> {
            Array2::zeros((rows, self.dim))
        }

        fn predict(
            &mut self,
            labels: ArrayView1<i32>,
            state: Option<&Array2<f32>>,
        ) -> Result<(Array2<f32>, Array2<f32>), Box<dyn Error + Send + Sync>> {
            let rows = labels.len();
            let mut next = match state {
                Some(state) => state.clone(),
                None => Array2::zeros((rows, self.dim)),
            };
            for r in 0..rows {
                for h in 0..self.dim {
                    let drive = ((labels[r] as f32 + 2.0) * (h as f32 + 1.0) * 0.37).sin();
                    next[[r, h]] = next[[r, h]] * 0.5 + drive;
                }
            }
            Ok((next.clone(), next))
        }

        fn gather_state(&self, state: &Array2<f32>, parent_rows: &[usize]) -> Array2<f32> {
            let mut out = Array2::zeros((parent_rows.len(), state.ncols()));
            for (r, &src) in parent_rows.iter().enumerate() {
                out.row_mut(r).assign(&state.row(src));
            }
            out
        }

        fn replace_state_rows(&self, dst: &mut Array2<f32>, src: &Array2<f32>, mask: &[bool]) {
            for (r, &keep) in mask.iter().enumerate() {
                if keep {
                    dst.row_mut(r).assign(&src.row(r));
                }
            }
        }
    }

    // joint mixing encoder and decoder rows through fixed sinusoidal
    // weights; blank_bias shifts the last class
    struct ToyJoint {
        vocab: usize,
        blank_bias: f32,
    }

    impl AcousticStepModel for ToyJoint {
        fn project_encoder(
            &mut self,
            encoder_output: ndarray::ArrayView3<f32>,
        ) -> Result<Array3<f32>, Box<dyn Error + Send + Sync>> {
            Ok(encoder_output.to_owned())
        }

        fn project_prednet(
            &mut self,
            decoder_output: ArrayView2<f32>,
        ) -> Result<Array2<f32>, Box<dyn Error + Send + Sync>> {
            Ok(decoder_output.to_owned())
        }

        fn joint_after_projection(
            &mut self,
            encoder_rows: ArrayView2<f32>,
            decoder_rows: ArrayView2<f32>,
        ) -> Result<Array2<f32>, Box<dyn Error + Send + Sync>> {
            let rows = encoder_rows.nrows();
            let mut logits = Array2::zeros((rows, self.vocab + 1));
            for r in 0..rows {
                for v in 0..=self.vocab {
                    let mut acc = 0.0f32;
                    for (d, &x) in encoder_rows.row(r).iter().enumerate() {
                        acc += x * ((v as f32 + 1.0) * (d as f32 + 1.0) * 0.61).sin();
                    }
                    for (d, &x) in decoder_rows.row(r).iter().enumerate() {
                        acc += x * ((v as f32 + 3.0) * (d as f32 + 2.0) * 0.23).cos();
                    }
                    if v == self.vocab {
                        acc += self.blank_bias;
                    }
                    logits[[r, v]] = acc;
                }
            }
            Ok(logits)
        }
    }

    fn toy_encoder(batch: usize, time: usize, dim: usize) -> Array3<f32> {
        let mut enc = Array3::zeros((batch, time, dim));
        for b in 0..batch {
            for t in 0..time {
                for d in 0..dim {
                    enc[[b, t, d]] = (((b * 31 + t * 7 + d * 3 + 1) % 13) as f32) * 0.21 - 1.1;
                }
            }
        }
        enc
    }

    fn toy_decoder(
        vocab: usize,
        blank_bias: f32,
        config: MalsdBeamConfig,
        platform: DevicePlatform,
    ) -> BatchedMalsdDecoder<ToyPredictor, ToyJoint> {
        BatchedMalsdDecoder::new(
            ToyPredictor { dim: 3 },
            ToyJoint { vocab, blank_bias },
            None,
            config,
            platform,
        )
        .unwrap()
    }

    fn base_config(vocab: usize) -> MalsdBeamConfig {
        MalsdBeamConfig {
            beam_size: 2,
            blank_index: vocab,
            max_symbols_per_step: Some(3),
            allow_graphs: false,
            ..MalsdBeamConfig::default()
        }
    }

    #[test]
    fn rejects_bad_configurations() {
        let make = |config: MalsdBeamConfig| {
            BatchedMalsdDecoder::new(
                ToyPredictor { dim: 2 },
                ToyJoint {
                    vocab: 3,
                    blank_bias: 0.0,
                },
                None,
                config,
                DevicePlatform::host(),
            )
        };
        assert!(make(MalsdBeamConfig {
            beam_size: 0,
            blank_index: 3,
            ..MalsdBeamConfig::default()
        })
        .is_err());
        assert!(make(MalsdBeamConfig {
            beam_size: 2,
            blank_index: 0,
            ..MalsdBeamConfig::default()
        })
        .is_err());
        assert!(make(MalsdBeamConfig {
            beam_size: 5,
            blank_index: 3,
            ..MalsdBeamConfig::default()
        })
        .is_err());
        assert!(make(MalsdBeamConfig {
            beam_size: 2,
            blank_index: 3,
            max_symbols_per_step: Some(0),
            ..MalsdBeamConfig::default()
        })
        .is_err());
    }

    #[test]
    fn rejects_mismatched_language_model() {
        let lm = crate::trie_lm::TrieNGramLM::from_sentences(2, 5, &[vec![0, 1]]).unwrap();
        let result = BatchedMalsdDecoder::new(
            ToyPredictor { dim: 2 },
            ToyJoint {
                vocab: 3,
                blank_bias: 0.0,
            },
            Some(Box::new(lm)),
            MalsdBeamConfig {
                beam_size: 2,
                blank_index: 3,
                ..MalsdBeamConfig::default()
            },
            DevicePlatform::host(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn graph_enablement_follows_the_platform() {
        let config = MalsdBeamConfig {
            beam_size: 2,
            blank_index: 3,
            allow_graphs: true,
            ..MalsdBeamConfig::default()
        };
        let decoder = toy_decoder(3, 0.0, config, DevicePlatform::host());
        assert_eq!(decoder.execution_mode(), ExecutionMode::PartialGraphs);
        let decoder = toy_decoder(3, 0.0, config, DevicePlatform::with_conditional_nodes());
        assert_eq!(decoder.execution_mode(), ExecutionMode::FullGraph);
        let mut decoder = toy_decoder(
            3,
            0.0,
            MalsdBeamConfig {
                allow_graphs: false,
                ..config
            },
            DevicePlatform::with_conditional_nodes(),
        );
        assert_eq!(decoder.execution_mode(), ExecutionMode::Eager);
        decoder.force_mode(ExecutionMode::FullGraph);
        assert_eq!(decoder.execution_mode(), ExecutionMode::FullGraph);
        decoder.disable_graphs();
        assert_eq!(decoder.execution_mode(), ExecutionMode::Eager);
    }

    #[test]
    fn unbounded_symbol_mode_is_forced_when_graphs_are_enabled() {
        let config = MalsdBeamConfig {
            beam_size: 2,
            blank_index: 3,
            max_symbols_per_step: None,
            allow_graphs: true,
            ..MalsdBeamConfig::default()
        };
        let decoder = toy_decoder(3, 0.0, config, DevicePlatform::host());
        assert_eq!(decoder.max_symbols, Some(10));
    }

    #[test]
    fn decode_terminates_and_respects_lane_lengths() {
        let vocab = 4;
        let mut decoder = toy_decoder(vocab, 0.5, base_config(vocab), DevicePlatform::host());
        let enc = toy_encoder(2, 6, 3);
        let lengths = ndarray::arr1(&[6usize, 2]);
        let hyps = decoder.decode(enc.view(), lengths.view()).unwrap();
        assert_eq!(hyps.len(), 2);
        for (b, hyp) in hyps.iter().enumerate() {
            assert_eq!(hyp.labels.len(), hyp.timestamps.len());
            assert!(hyp.labels.iter().all(|&l| l >= 0 && (l as usize) < vocab));
            assert!(hyp
                .timestamps
                .iter()
                .all(|&t| t < lengths[b]));
            assert!(hyp.labels.len() <= lengths[b] * 3);
        }
    }

    #[test]
    fn execution_modes_agree() {
        let vocab = 4;
        let enc = toy_encoder(2, 5, 3);
        let lengths = ndarray::arr1(&[5usize, 3]);
        let reference = {
            let mut decoder =
                toy_decoder(vocab, 0.2, base_config(vocab), DevicePlatform::host());
            decoder.decode(enc.view(), lengths.view()).unwrap()
        };
        for mode in [ExecutionMode::PartialGraphs, ExecutionMode::FullGraph]
            .iter()
            .copied()
        {
            let mut decoder =
                toy_decoder(vocab, 0.2, base_config(vocab), DevicePlatform::host());
            decoder.force_mode(mode);
            let hyps = decoder.decode(enc.view(), lengths.view()).unwrap();
            assert_eq!(hyps.len(), reference.len());
            for (got, want) in hyps.iter().zip(reference.iter()) {
                assert_eq!(got.labels, want.labels);
                assert_eq!(got.timestamps, want.timestamps);
                assert!((got.score - want.score).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn state_is_reused_until_a_larger_call_arrives() {
        let vocab = 4;
        let mut decoder = toy_decoder(vocab, 0.4, base_config(vocab), DevicePlatform::host());
        let enc = toy_encoder(2, 6, 3);
        decoder
            .decode(enc.view(), ndarray::arr1(&[6usize, 4]).view())
            .unwrap();
        assert_eq!(decoder.reinit_count, 1);
        // smaller call reuses the allocation
        let small = toy_encoder(1, 3, 3);
        let hyps = decoder
            .decode(small.view(), ndarray::arr1(&[3usize]).view())
            .unwrap();
        assert_eq!(decoder.reinit_count, 1);
        assert_eq!(hyps.len(), 1);
        // larger batch forces a rebuild
        let big = toy_encoder(3, 4, 3);
        decoder
            .decode(big.view(), ndarray::arr1(&[4usize, 2, 0]).view())
            .unwrap();
        assert_eq!(decoder.reinit_count, 2);
    }

    #[test]
    fn zero_length_lanes_produce_empty_hypotheses() {
        let vocab = 4;
        let mut decoder = toy_decoder(vocab, 0.3, base_config(vocab), DevicePlatform::host());
        let enc = toy_encoder(2, 4, 3);
        let hyps = decoder
            .decode(enc.view(), ndarray::arr1(&[0usize, 4]).view())
            .unwrap();
        assert_eq!(hyps.len(), 2);
        assert!(hyps[0].labels.is_empty());
        assert!(hyps[0].timestamps.is_empty());
        assert_eq!(hyps[0].score, 0.0);
    }

    #[test]
    fn unbounded_mode_still_terminates_with_a_blank_heavy_joint() {
        let vocab = 4;
        let mut decoder = toy_decoder(
            vocab,
            6.0,
            MalsdBeamConfig {
                max_symbols_per_step: None,
                ..base_config(vocab)
            },
            DevicePlatform::host(),
        );
        let enc = toy_encoder(1, 5, 3);
        let hyps = decoder
            .decode(enc.view(), ndarray::arr1(&[5usize]).view())
            .unwrap();
        assert_eq!(hyps.len(), 1);
    }
}
