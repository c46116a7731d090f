extern crate ndarray;

use std::error::Error;
use std::fmt;
use std::marker::{Send, Sync};

pub mod audio_model;
pub mod beam_hyps;
pub mod bsearch_malsd;
pub mod fast_math;
pub mod graph_exec;
pub mod language_model;
pub mod lm_fusion;
pub mod trie_lm;

pub use audio_model::{AcousticStepModel, LabelPredictor};
pub use beam_hyps::{BatchedBeamHyps, Hypothesis};
pub use bsearch_malsd::{BatchedMalsdDecoder, MalsdBeamConfig};
pub use graph_exec::{DevicePlatform, ExecutionMode};
pub use language_model::NGramLanguageModel;
pub use lm_fusion::{BlankScoreMode, PruningMode};
pub use trie_lm::TrieNGramLM;

#[derive(Debug)]
pub enum DecodeError {
    InvalidConfig(String),
    UnsupportedLmFusion(String),
    ShapeMismatch(String),
    Model(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidConfig(msg) => {
                write!(f, "Invalid decoding configuration: {}", msg)
            }
            DecodeError::UnsupportedLmFusion(msg) => {
                write!(f, "Unsupported language model fusion: {}", msg)
            }
            DecodeError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            DecodeError::Model(err) => write!(f, "Model call failed: {}", err),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DecodeError::Model(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
