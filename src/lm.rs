//! Language-model scoring interface consumed by the beam search.
//!
//! The decoder never sees the model's internals — n-gram tables, pruning,
//! file format all stay behind a narrow functional interface: state in,
//! score and state out. Anything that can score a word given an opaque
//! history can plug in here.

use std::collections::HashMap;

/// A word-level scorer consumed by [`crate::beam::BeamSearchDecoder`].
///
/// Implementations must be deterministic and side-effect-free from the
/// decoder's perspective: the same state and word always produce the same
/// increment and continuation state. The state type is opaque to the
/// decoder; it is cloned when hypotheses fork.
pub trait WordScorer {
    type State: Clone;

    /// The scoring state before any word has been seen.
    fn initial_state(&self) -> Self::State;

    /// Score `word` as a continuation of `state`.
    ///
    /// Returns the log-probability increment and the state to carry forward.
    fn score_word(&self, state: &Self::State, word: &str) -> (f64, Self::State);
}

/// The default scorer: no language model, every word is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLanguageModel;

impl WordScorer for NoLanguageModel {
    type State = ();

    fn initial_state(&self) -> Self::State {}

    fn score_word(&self, _state: &Self::State, _word: &str) -> (f64, Self::State) {
        (0.0, ())
    }
}

/// A small in-memory bigram scorer.
///
/// Real deployments consume trained n-gram models through [`WordScorer`];
/// this table-backed variant exists for tests and the CLI, where a handful
/// of hand-picked scores is all that is needed.
#[derive(Debug, Clone)]
pub struct BigramScorer {
    unigrams: HashMap<String, f64>,
    bigrams: HashMap<(String, String), f64>,
    unknown: f64,
}

impl BigramScorer {
    /// Create a scorer that assigns `unknown` to every out-of-table word.
    pub fn new(unknown: f64) -> Self {
        Self {
            unigrams: HashMap::new(),
            bigrams: HashMap::new(),
            unknown,
        }
    }

    pub fn with_unigram(mut self, word: impl Into<String>, log_prob: f64) -> Self {
        self.unigrams.insert(word.into(), log_prob);
        self
    }

    pub fn with_bigram(
        mut self,
        previous: impl Into<String>,
        word: impl Into<String>,
        log_prob: f64,
    ) -> Self {
        self.bigrams.insert((previous.into(), word.into()), log_prob);
        self
    }
}

impl WordScorer for BigramScorer {
    /// The previously scored word, if any.
    type State = Option<String>;

    fn initial_state(&self) -> Self::State {
        None
    }

    fn score_word(&self, state: &Self::State, word: &str) -> (f64, Self::State) {
        let score = state
            .as_ref()
            .and_then(|previous| self.bigrams.get(&(previous.clone(), word.to_owned())))
            .or_else(|| self.unigrams.get(word))
            .copied()
            .unwrap_or(self.unknown);
        (score, Some(word.to_owned()))
    }
}
