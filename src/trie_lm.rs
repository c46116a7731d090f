use super::DecodeError;
use crate::fast_math;
use crate::language_model::NGramLanguageModel;
use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;
use std::error::Error;
use std::marker::{Send, Sync};

extern crate patricia_tree;
use patricia_tree::PatriciaMap;

const BACKOFF_FACTOR: f32 = 0.4;

// context tokens packed big-endian so byte prefixes align with token
// boundaries in the trie
fn key_of(context: &[u32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(context.len() * 4);
    for token in context {
        key.extend_from_slice(&token.to_be_bytes());
    }
    key
}

/// Count-based n-gram model over integer labels with stupid backoff.
///
/// All reachable contexts are enumerated at construction and scored into
/// dense per-state tables, so `advance` is a row copy per beam slot. The
/// begin-of-sentence marker is a sentinel token that only ever appears
/// inside contexts.
#[derive(Debug)]
pub struct TrieNGramLM {
    order: usize,
    vocab: usize,
    contexts: PatriciaMap<usize>,
    context_of: Vec<Vec<u32>>,
    scores: Array2<f32>,
    next_states: Array2<usize>,
    bos_state: usize,
}

impl TrieNGramLM {
    pub fn from_sentences(
        order: usize,
        vocab: usize,
        sentences: &[Vec<u32>],
    ) -> Result<TrieNGramLM, DecodeError> {
        if order == 0 || vocab == 0 {
            return Err(DecodeError::InvalidConfig(format!(
                "n-gram order and vocabulary must be positive, got order {} over {} labels",
                order, vocab
            )));
        }
        let bos = vocab as u32;

        // count every event under its full context and all suffix contexts,
        // so each backoff order has its own maximum-likelihood estimate
        let mut counts: BTreeMap<Vec<u32>, BTreeMap<u32, usize>> = BTreeMap::new();
        counts.entry(Vec::new()).or_insert_with(BTreeMap::new);
        for sentence in sentences {
            let mut history: Vec<u32> = vec![bos; order - 1];
            for &token in sentence {
                if token as usize >= vocab {
                    return Err(DecodeError::InvalidConfig(format!(
                        "training token {} outside the {}-label vocabulary",
                        token, vocab
                    )));
                }
                for start in 0..=history.len() {
                    let context = history[start..].to_vec();
                    *counts
                        .entry(context)
                        .or_insert_with(BTreeMap::new)
                        .entry(token)
                        .or_insert(0) += 1;
                }
                history.push(token);
                if history.len() > order - 1 {
                    history.remove(0);
                }
            }
        }

        // the empty context sorts first, so state 0 is always the root
        let mut contexts = PatriciaMap::new();
        let mut context_of: Vec<Vec<u32>> = Vec::with_capacity(counts.len());
        for (id, context) in counts.keys().enumerate() {
            if !context.is_empty() {
                contexts.insert(key_of(context), id);
            }
            context_of.push(context.clone());
        }

        let nstates = context_of.len();
        let mut scores = Array2::<f32>::zeros((nstates, vocab));
        let mut next_states = Array2::<usize>::zeros((nstates, vocab));
        for (s, context) in context_of.iter().enumerate() {
            for v in 0..vocab {
                scores[[s, v]] = backoff_score(&counts, context, v as u32, vocab);
                next_states[[s, v]] = resolve_next(&contexts, context, v as u32, order);
            }
        }

        let mut bos_context = vec![bos; order - 1];
        let bos_state = loop {
            if bos_context.is_empty() {
                break 0;
            }
            if let Some(id) = contexts.get(&key_of(&bos_context)) {
                break *id;
            }
            bos_context.remove(0);
        };

        Ok(TrieNGramLM {
            order: order,
            vocab: vocab,
            contexts: contexts,
            context_of: context_of,
            scores: scores,
            next_states: next_states,
            bos_state: bos_state,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_states(&self) -> usize {
        self.context_of.len()
    }

    /// Exact lookup of a context, without backoff.
    pub fn state_for_context(&self, context: &[u32]) -> Option<usize> {
        if context.is_empty() {
            return Some(0);
        }
        self.contexts.get(&key_of(context)).copied()
    }
}

fn backoff_score(
    counts: &BTreeMap<Vec<u32>, BTreeMap<u32, usize>>,
    context: &[u32],
    token: u32,
    vocab: usize,
) -> f32 {
    let mut penalty = 0.0f32;
    for start in 0..context.len() {
        if let Some(next) = counts.get(&context[start..]) {
            if let Some(&count) = next.get(&token) {
                let total: usize = next.values().sum();
                return penalty + fast_math::fast_log(count as f32 / total as f32);
            }
        }
        penalty += fast_math::fast_log(BACKOFF_FACTOR);
    }
    // add-one smoothed unigram floor, so every label stays finite
    let root = &counts[&Vec::new()];
    let count = root.get(&token).copied().unwrap_or(0);
    let total: usize = root.values().sum();
    penalty + fast_math::fast_log((count + 1) as f32 / (total + vocab) as f32)
}

// longest observed suffix of (context + token), capped at order - 1
fn resolve_next(contexts: &PatriciaMap<usize>, context: &[u32], token: u32, order: usize) -> usize {
    let mut extended = Vec::with_capacity(context.len() + 1);
    extended.extend_from_slice(context);
    extended.push(token);
    while extended.len() > order - 1 {
        extended.remove(0);
    }
    loop {
        if extended.is_empty() {
            return 0;
        }
        if let Some(id) = contexts.get(&key_of(&extended)) {
            return *id;
        }
        extended.remove(0);
    }
}

impl NGramLanguageModel for TrieNGramLM {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn init_states(&self, rows: usize, bos: bool) -> Array1<usize> {
        Array1::from_elem(rows, if bos { self.bos_state } else { 0 })
    }

    fn advance(
        &mut self,
        states: ArrayView1<usize>,
    ) -> Result<(Array2<f32>, Array2<usize>), Box<dyn Error + Send + Sync>> {
        let rows = states.len();
        let mut scores = Array2::<f32>::zeros((rows, self.vocab));
        let mut next = Array2::<usize>::zeros((rows, self.vocab));
        for (r, &s) in states.iter().enumerate() {
            if s >= self.context_of.len() {
                return Err(Box::new(DecodeError::ShapeMismatch(format!(
                    "language model state {} out of range, model has {} states",
                    s,
                    self.context_of.len()
                ))));
            }
            scores.row_mut(r).assign(&self.scores.row(s));
            next.row_mut(r).assign(&self.next_states.row(s));
        }
        Ok((scores, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn advance_one(lm: &mut TrieNGramLM, state: usize) -> (Vec<f32>, Vec<usize>) {
        let (scores, next) = lm.advance(arr1(&[state]).view()).unwrap();
        (scores.row(0).to_vec(), next.row(0).to_vec())
    }

    #[test]
    fn bigram_prefers_observed_continuations() {
        let mut lm =
            TrieNGramLM::from_sentences(2, 3, &[vec![0, 1], vec![0, 1], vec![0, 2]]).unwrap();
        let s0 = lm.state_for_context(&[0]).unwrap();
        let (scores, _) = advance_one(&mut lm, s0);
        // after 0: seen 1 twice and 2 once
        assert!(scores[1] > scores[2]);
        assert!((scores[1] - (2.0f32 / 3.0).ln()).abs() < 1e-3);
        // 0 never follows 0, so it backs off to the smoothed unigram:
        // root counts are {0: 3, 1: 2, 2: 1}
        let expected = 0.4f32.ln() + (4.0f32 / 9.0).ln();
        assert!((scores[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn unseen_continuations_fall_back_to_the_root() {
        let mut lm = TrieNGramLM::from_sentences(2, 4, &[vec![0, 1, 2]]).unwrap();
        // 3 never occurs, so no context state exists for it
        let (_, next) = advance_one(&mut lm, 0);
        assert_eq!(next[3], 0);
        assert!(lm.state_for_context(&[3]).is_none());
        // 2 occurs but nothing follows it, so [2] is not a context either
        assert_eq!(next[2], 0);
    }

    #[test]
    fn bos_state_biases_sentence_starts() {
        let mut lm = TrieNGramLM::from_sentences(
            2,
            3,
            &[vec![1, 0], vec![1, 2], vec![1, 0], vec![2, 0]],
        )
        .unwrap();
        let starts = lm.init_states(2, true);
        assert_eq!(starts[0], starts[1]);
        let (scores, _) = advance_one(&mut lm, starts[0]);
        // sentences start with 1 three times out of four
        assert!(scores[1] > scores[2]);
        assert!(scores[1] > scores[0]);
        assert_eq!(lm.init_states(2, false).to_vec(), vec![0, 0]);
    }

    #[test]
    fn next_states_follow_the_longest_observed_suffix() {
        let mut lm = TrieNGramLM::from_sentences(3, 4, &[vec![0, 1, 2, 3]]).unwrap();
        let s = lm.state_for_context(&[0, 1]).unwrap();
        let (_, next) = advance_one(&mut lm, s);
        // [1, 2] was observed as a context, so it is the successor of ([0, 1], 2)
        assert_eq!(next[2], lm.state_for_context(&[1, 2]).unwrap());
        // ([0, 1], 0) drops to the singleton context [0]
        assert_eq!(next[0], lm.state_for_context(&[0]).unwrap());
        // ([0, 1], 3): neither [1, 3] nor [3] was ever a context
        assert_eq!(next[3], 0);
    }

    #[test]
    fn scores_are_normalized_per_state() {
        let mut lm = TrieNGramLM::from_sentences(2, 3, &[vec![0, 1, 1, 2, 0]]).unwrap();
        for s in 0..lm.num_states() {
            let (scores, next) = advance_one(&mut lm, s);
            assert!(scores.iter().all(|&v| v <= 0.0 && v.is_finite()));
            assert!(next.iter().all(|&n| n < lm.num_states()));
        }
    }

    #[test]
    fn rejects_out_of_vocabulary_training_tokens() {
        let err = TrieNGramLM::from_sentences(2, 3, &[vec![0, 7]]).unwrap_err();
        assert!(format!("{}", err).contains("vocabulary"));
    }
}
