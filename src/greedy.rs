//! Greedy (best-path) decoding.
//!
//! Picks the arg-max symbol at every timestep and collapses the resulting
//! path. Purely local — `O(time × alphabet)` per sequence, no search — which
//! makes it the fast baseline the beam search is measured against.

use ndarray::{ArrayView2, ArrayView3, s};

use crate::alphabet::Alphabet;
use crate::batch;
use crate::collapse::collapse_path_with_steps;
use crate::error::Result;
use crate::hypothesis::{DecodedHypothesis, DecodedStep};

/// Options that control greedy decoding.
#[derive(Debug, Clone)]
pub struct GreedyOpts {
    /// Render decoded text as-is. When false, text is lowercased.
    pub case_sensitive: bool,
}

impl Default for GreedyOpts {
    fn default() -> Self {
        Self {
            case_sensitive: true,
        }
    }
}

/// Arg-max decoder over emission log-probabilities.
pub struct GreedyDecoder {
    alphabet: Alphabet,
    opts: GreedyOpts,
}

impl GreedyDecoder {
    pub fn new(alphabet: Alphabet) -> Self {
        Self::with_opts(alphabet, GreedyOpts::default())
    }

    pub fn with_opts(alphabet: Alphabet, opts: GreedyOpts) -> Self {
        Self { alphabet, opts }
    }

    /// Decode one sequence, `(time, alphabet)` log-probabilities.
    ///
    /// The hypothesis score is the sum of the chosen symbols' log
    /// probabilities, i.e. the probability of the single best path, not of
    /// all paths producing the same labels (the beam search sums those).
    pub fn decode(&self, log_probs: ArrayView2<'_, f64>) -> Result<DecodedHypothesis> {
        let (hypothesis, _) = self.decode_with_confidence(log_probs)?;
        Ok(hypothesis)
    }

    /// Decode one sequence and also report, per timestep, the probability of
    /// the symbol the decoder picked there. Useful as a cheap diagnostic for
    /// how certain the model was along the best path.
    pub fn decode_with_confidence(
        &self,
        log_probs: ArrayView2<'_, f64>,
    ) -> Result<(DecodedHypothesis, Vec<f64>)> {
        batch::validate_sequence(&log_probs, log_probs.nrows(), self.alphabet.size())?;

        let mut path = Vec::with_capacity(log_probs.nrows());
        let mut confidence = Vec::with_capacity(log_probs.nrows());
        let mut acoustic_score = 0.0;
        for row in log_probs.outer_iter() {
            let mut best = 0;
            for (symbol, &value) in row.iter().enumerate() {
                if value > row[best] {
                    best = symbol;
                }
            }
            path.push(best);
            acoustic_score += row[best];
            confidence.push(row[best].exp());
        }

        let steps: Vec<DecodedStep> = collapse_path_with_steps(&path, self.alphabet.blank())
            .into_iter()
            .map(|(label, timestep)| DecodedStep { label, timestep })
            .collect();
        let labels: Vec<usize> = steps.iter().map(|step| step.label).collect();
        let mut text = self.alphabet.render(&labels);
        if !self.opts.case_sensitive {
            text = text.to_lowercase();
        }
        let word_count = self.alphabet.word_count(&labels);

        Ok((
            DecodedHypothesis {
                steps,
                text,
                score: acoustic_score,
                acoustic_score,
                lm_score: 0.0,
                word_count,
            },
            confidence,
        ))
    }

    /// Decode a ragged batch. Sequences are independent and are spread
    /// across the worker pool; each slot holds that sequence's hypothesis or
    /// its own error.
    pub fn decode_batch(
        &self,
        emissions: ArrayView3<'_, f64>,
        lengths: &[usize],
        time_major: bool,
    ) -> Result<Vec<Result<DecodedHypothesis>>> {
        batch::validate_batch(&emissions, lengths, self.alphabet.size(), time_major)?;
        let (batch_size, _, _) = batch::batch_dims(&emissions, time_major);
        Ok(batch::run_per_sequence(batch_size, |i| {
            let view = batch::sequence_view(emissions.clone(), i, time_major);
            self.decode(view.slice_move(s![..lengths[i], ..]))
        }))
    }
}
