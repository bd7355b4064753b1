//! Prefix beam search over CTC emissions.
//!
//! The frontier is a mapping from merge key to hypothesis, rebuilt wholesale
//! each timestep: the previous frontier becomes immutable history and every
//! extension lands in a fresh map. The merge key — collapsed label sequence,
//! last emitted symbol, trailing-blank flag — is the minimum state that makes
//! two acoustic paths indistinguishable for every future extension under
//! CTC's collapsing rules. Dropping the trailing-blank flag would wrongly
//! merge paths that differ in whether a repeated label still counts
//! separately.
//!
//! Scoring combines the acoustic log-probability (path mass, summed in log
//! space on merges), a weighted word-level language-model score, and a word
//! insertion bonus. Language-model state is opaque and carried per
//! hypothesis; the scorer is consulted whenever a word boundary completes a
//! word, and once more at the end of the sequence for the pending word.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use ndarray::{ArrayView1, ArrayView2, ArrayView3, s};
use tracing::{debug, trace};

use crate::alphabet::Alphabet;
use crate::batch;
use crate::error::{Error, Result};
use crate::hypothesis::{DecodedHypothesis, DecodedStep};
use crate::lm::{NoLanguageModel, WordScorer};
use crate::math::log_sum_exp;

/// Options that control a beam search.
#[derive(Debug, Clone)]
pub struct BeamSearchOpts {
    /// Maximum number of hypotheses retained after each timestep.
    pub beam_width: usize,

    /// Number of ranked hypotheses to return; at most `beam_width`.
    pub num_results: usize,

    /// Weight of the language-model score in the combined ranking score.
    pub lm_weight: f64,

    /// Additive bonus per completed word. Counters the language model's
    /// tendency to prefer fewer, longer words.
    pub word_bonus: f64,

    /// Symbols whose emission probability falls below this threshold are not
    /// expanded. Zero disables pruning. If a timestep would lose every
    /// candidate to the threshold it is re-expanded without it, so the
    /// search always progresses.
    pub pruning_threshold: f64,

    /// Score and render text as-is. When false, words are lowercased before
    /// language-model lookup and the decoded text is lowercased.
    pub case_sensitive: bool,
}

impl Default for BeamSearchOpts {
    fn default() -> Self {
        Self {
            beam_width: 64,
            num_results: 1,
            lm_weight: 1.0,
            word_bonus: 0.0,
            pruning_threshold: 0.0,
            case_sensitive: true,
        }
    }
}

/// Identity of a hypothesis for merging within a timestep.
#[derive(Clone, PartialEq, Eq, Hash)]
struct MergeKey {
    labels: Vec<usize>,
    last: Option<usize>,
    trailing_blank: bool,
}

/// A live search hypothesis.
///
/// `word_start` indexes into `steps` where the in-progress word begins;
/// everything before it has already been scored. Candidates with equal merge
/// keys carry identical label sequences, hence identical word histories,
/// hence identical language-model scores and states — merging only ever sums
/// acoustic mass.
#[derive(Clone)]
struct Candidate<St> {
    steps: Vec<DecodedStep>,
    last: Option<usize>,
    trailing_blank: bool,
    acoustic: f64,
    lm: f64,
    word_count: usize,
    word_start: usize,
    lm_state: St,
}

impl<St: Clone> Candidate<St> {
    fn root(lm_state: St) -> Self {
        Self {
            steps: Vec::new(),
            last: None,
            trailing_blank: false,
            acoustic: 0.0,
            lm: 0.0,
            word_count: 0,
            word_start: 0,
            lm_state,
        }
    }

    fn key(&self) -> MergeKey {
        MergeKey {
            labels: self.labels(),
            last: self.last,
            trailing_blank: self.trailing_blank,
        }
    }

    fn labels(&self) -> Vec<usize> {
        self.steps.iter().map(|step| step.label).collect()
    }

    fn combined(&self, opts: &BeamSearchOpts) -> f64 {
        self.acoustic + opts.lm_weight * self.lm + opts.word_bonus * self.word_count as f64
    }
}

fn compare_labels(a: &[DecodedStep], b: &[DecodedStep]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.label.cmp(&y.label) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Sort by combined score, best first, and keep the top `keep`.
///
/// Ties order lexicographically on the label sequence so results are
/// deterministic regardless of map iteration order.
fn rank<St: Clone>(
    mut candidates: Vec<Candidate<St>>,
    opts: &BeamSearchOpts,
    keep: usize,
) -> Vec<Candidate<St>> {
    candidates.sort_by(|a, b| {
        b.combined(opts)
            .total_cmp(&a.combined(opts))
            .then_with(|| compare_labels(&a.steps, &b.steps))
    });
    candidates.truncate(keep);
    candidates
}

/// Beam search decoder, optionally rescored by a word-level language model.
///
/// Without a scorer, `BeamSearchDecoder::new` plugs in [`NoLanguageModel`]
/// and ranking is purely acoustic (plus any word bonus).
pub struct BeamSearchDecoder<S: WordScorer = NoLanguageModel> {
    alphabet: Alphabet,
    opts: BeamSearchOpts,
    scorer: S,
}

impl BeamSearchDecoder<NoLanguageModel> {
    /// Create a decoder with no language model.
    pub fn new(alphabet: Alphabet, opts: BeamSearchOpts) -> Result<Self> {
        Self::with_scorer(alphabet, opts, NoLanguageModel)
    }
}

impl<S: WordScorer> BeamSearchDecoder<S> {
    /// Create a decoder that rescores completed words through `scorer`.
    ///
    /// Configuration is validated here, before any decoding starts.
    pub fn with_scorer(alphabet: Alphabet, opts: BeamSearchOpts, scorer: S) -> Result<Self> {
        if opts.beam_width == 0 {
            return Err(Error::config("beam width must be at least 1"));
        }
        if opts.num_results == 0 {
            return Err(Error::config("at least one result must be requested"));
        }
        if opts.num_results > opts.beam_width {
            return Err(Error::config(format!(
                "cannot return {} results from a beam of width {}",
                opts.num_results, opts.beam_width
            )));
        }
        if !(0.0..1.0).contains(&opts.pruning_threshold) {
            return Err(Error::config(
                "pruning threshold must be a probability below 1",
            ));
        }
        if !opts.lm_weight.is_finite() || !opts.word_bonus.is_finite() {
            return Err(Error::config("scoring weights must be finite"));
        }
        Ok(Self {
            alphabet,
            opts,
            scorer,
        })
    }

    /// Decode one sequence of `(time, alphabet)` log-probabilities into the
    /// top `num_results` hypotheses, best first.
    pub fn decode(&self, log_probs: ArrayView2<'_, f64>) -> Result<Vec<DecodedHypothesis>> {
        batch::validate_sequence(&log_probs, log_probs.nrows(), self.alphabet.size())?;

        let cutoff = if self.opts.pruning_threshold > 0.0 {
            self.opts.pruning_threshold.ln()
        } else {
            f64::NEG_INFINITY
        };

        let mut frontier = vec![Candidate::root(self.scorer.initial_state())];
        for (timestep, row) in log_probs.outer_iter().enumerate() {
            let mut merged = self.expand(&frontier, row, cutoff, timestep);
            if merged.is_empty() && cutoff > f64::NEG_INFINITY {
                // The threshold starved the frontier; retry without it.
                merged = self.expand(&frontier, row, f64::NEG_INFINITY, timestep);
            }
            if merged.is_empty() {
                // Degenerate all-zero frame; nothing to update.
                continue;
            }
            frontier = rank(
                merged.into_values().collect(),
                &self.opts,
                self.opts.beam_width,
            );
            trace!(timestep, frontier = frontier.len(), "pruned frontier");
        }

        let finalized = self.finalize(frontier);
        let ranked = rank(finalized, &self.opts, self.opts.num_results);
        debug!(results = ranked.len(), "beam search finished");
        Ok(ranked
            .into_iter()
            .map(|candidate| self.into_hypothesis(candidate))
            .collect())
    }

    /// Decode a ragged batch on the worker pool. Each slot holds that
    /// sequence's ranked hypotheses or its own error.
    pub fn decode_batch(
        &self,
        emissions: ArrayView3<'_, f64>,
        lengths: &[usize],
        time_major: bool,
    ) -> Result<Vec<Result<Vec<DecodedHypothesis>>>>
    where
        S: Sync,
    {
        batch::validate_batch(&emissions, lengths, self.alphabet.size(), time_major)?;
        let (batch_size, _, _) = batch::batch_dims(&emissions, time_major);
        Ok(batch::run_per_sequence(batch_size, |i| {
            let view = batch::sequence_view(emissions.clone(), i, time_major);
            self.decode(view.slice_move(s![..lengths[i], ..]))
        }))
    }

    /// Score `words` in order from the scorer's initial state, applying the
    /// decoder's casing. Diagnostic counterpart of the in-search word
    /// scoring: each returned value is one word's log-probability increment.
    pub fn score_words(&self, words: &[&str]) -> Vec<f64> {
        let mut state = self.scorer.initial_state();
        words
            .iter()
            .map(|word| {
                let cased = self.cased(word);
                let (increment, next) = self.scorer.score_word(&state, &cased);
                state = next;
                increment
            })
            .collect()
    }

    /// One timestep of expansion: every frontier hypothesis crossed with
    /// every symbol above the cutoff, merged by key.
    fn expand(
        &self,
        frontier: &[Candidate<S::State>],
        row: ArrayView1<'_, f64>,
        cutoff: f64,
        timestep: usize,
    ) -> HashMap<MergeKey, Candidate<S::State>> {
        let blank = self.alphabet.blank();
        let mut merged: HashMap<MergeKey, Candidate<S::State>> =
            HashMap::with_capacity(frontier.len() * 2);

        for hypothesis in frontier {
            for (symbol, &log_prob) in row.iter().enumerate() {
                // Zero-probability extensions contribute nothing.
                if log_prob < cutoff || log_prob == f64::NEG_INFINITY {
                    continue;
                }

                let candidate = if symbol == blank {
                    // The collapsed sequence is unchanged; only mass moves.
                    let mut next = hypothesis.clone();
                    next.trailing_blank = true;
                    next.acoustic += log_prob;
                    Some(next)
                } else if hypothesis.last == Some(symbol) && !hypothesis.trailing_blank {
                    // Unseparated repeat: merged into the existing label.
                    let mut next = hypothesis.clone();
                    next.acoustic += log_prob;
                    Some(next)
                } else {
                    self.extend_with_label(hypothesis, symbol, log_prob, timestep)
                };
                let Some(candidate) = candidate else { continue };

                match merged.entry(candidate.key()) {
                    Entry::Occupied(mut present) => {
                        let present = present.get_mut();
                        present.acoustic = log_sum_exp(present.acoustic, candidate.acoustic);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(candidate);
                    }
                }
            }
        }
        merged
    }

    /// Append a new label, completing a word when the separator is crossed.
    ///
    /// Returns `None` when the language model rejects the word with a
    /// non-finite score; the candidate is excluded rather than propagated
    /// into the ranking.
    fn extend_with_label(
        &self,
        hypothesis: &Candidate<S::State>,
        symbol: usize,
        log_prob: f64,
        timestep: usize,
    ) -> Option<Candidate<S::State>> {
        let mut next = hypothesis.clone();
        next.acoustic += log_prob;
        next.trailing_blank = false;
        next.last = Some(symbol);

        if Some(symbol) == self.alphabet.separator() {
            let pending = next.labels()[next.word_start..].to_vec();
            if !pending.is_empty() {
                let word = self.alphabet.render(&pending);
                next.word_count += 1;
                self.score_pending_word(&mut next, &word)?;
            }
            next.steps.push(DecodedStep {
                label: symbol,
                timestep,
            });
            next.word_start = next.steps.len();
        } else {
            next.steps.push(DecodedStep {
                label: symbol,
                timestep,
            });
        }
        Some(next)
    }

    fn score_pending_word(&self, candidate: &mut Candidate<S::State>, word: &str) -> Option<()> {
        let cased = self.cased(word);
        let (increment, state) = self.scorer.score_word(&candidate.lm_state, &cased);
        if !increment.is_finite() {
            return None;
        }
        candidate.lm += increment;
        candidate.lm_state = state;
        Some(())
    }

    /// End-of-sequence handling: flush each hypothesis's in-progress word
    /// through the scorer, then merge hypotheses that collapse to the same
    /// label sequence — their key differed only in state that no longer
    /// matters once no extensions remain.
    fn finalize(&self, frontier: Vec<Candidate<S::State>>) -> Vec<Candidate<S::State>> {
        let mut merged: HashMap<Vec<usize>, Candidate<S::State>> =
            HashMap::with_capacity(frontier.len());
        for mut candidate in frontier {
            let pending = candidate.labels()[candidate.word_start..].to_vec();
            if !pending.is_empty() {
                let word = self.alphabet.render(&pending);
                candidate.word_count += 1;
                if self.score_pending_word(&mut candidate, &word).is_none() {
                    continue;
                }
            }
            match merged.entry(candidate.labels()) {
                Entry::Occupied(mut present) => {
                    let present = present.get_mut();
                    present.acoustic = log_sum_exp(present.acoustic, candidate.acoustic);
                }
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
            }
        }
        merged.into_values().collect()
    }

    fn cased(&self, word: &str) -> String {
        if self.opts.case_sensitive {
            word.to_owned()
        } else {
            word.to_lowercase()
        }
    }

    fn into_hypothesis(&self, candidate: Candidate<S::State>) -> DecodedHypothesis {
        let mut text = self.alphabet.render(&candidate.labels());
        if !self.opts.case_sensitive {
            text = text.to_lowercase();
        }
        DecodedHypothesis {
            score: candidate.combined(&self.opts),
            acoustic_score: candidate.acoustic,
            lm_score: candidate.lm,
            word_count: candidate.word_count,
            steps: candidate.steps,
            text,
        }
    }
}
