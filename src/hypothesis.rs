//! Decode result types shared by the greedy and beam decoders.

use serde::Serialize;

/// One decoded label together with the timestep where it first appeared.
///
/// CTC decoding skips blanks and merged repeats, so a label's timestep is
/// the first frame of the run that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedStep {
    pub label: usize,
    pub timestep: usize,
}

/// A ranked decoding hypothesis.
///
/// `score` is the combined ranking score: acoustic log-probability plus the
/// weighted language-model contribution plus the word-insertion bonus. The
/// unweighted components are kept alongside so callers can re-rank or
/// inspect them. Greedy decoding has no language model, so there
/// `score == acoustic_score` and `lm_score == 0`.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedHypothesis {
    pub steps: Vec<DecodedStep>,
    pub text: String,
    pub score: f64,
    pub acoustic_score: f64,
    pub lm_score: f64,
    pub word_count: usize,
}

impl DecodedHypothesis {
    /// The collapsed label sequence without timesteps.
    pub fn labels(&self) -> Vec<usize> {
        self.steps.iter().map(|step| step.label).collect()
    }
}
