//! CTC loss: forward-backward negative log-likelihood and its gradient.
//!
//! For each sequence the target labels are interleaved with blanks into an
//! extended sequence of length `2L + 1`, then a forward table α and a
//! backward table β are filled over `(extended position, timestep)` in log
//! space. The total log-likelihood reads off the two valid terminal α
//! entries; the gradient at `(t, k)` is the model's output probability minus
//! the posterior occupation probability of symbol `k` at time `t`, the
//! convention of Graves' original derivation (gradient with respect to the
//! pre-softmax activations).
//!
//! Sequences in a batch are independent and are processed on the worker pool
//! in `batch`. A sequence that cannot be aligned reports its error in its
//! own result slot without disturbing siblings.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use tracing::debug;

use crate::alphabet::Alphabet;
use crate::batch;
use crate::error::{Error, Result};
use crate::math::log_sum_exp;

/// Options that control how a loss computation is performed.
///
/// These are *library-level configuration*, not framework flags: the host
/// training loop maps its own conventions onto this type.
#[derive(Debug, Clone)]
pub struct LossOpts {
    /// Divide the batch total (and the gradient) by the batch size instead of
    /// summing.
    pub size_average: bool,

    /// Emissions are laid out `(time, batch, alphabet)` instead of
    /// `(batch, time, alphabet)`. Layout only; semantics are unchanged and
    /// the gradient comes back in the same layout as the input.
    pub time_major: bool,

    /// Inputs are raw activations; apply a log-softmax per frame before
    /// computing. When false, inputs must already be log-probabilities.
    pub apply_log_softmax: bool,
}

impl Default for LossOpts {
    fn default() -> Self {
        Self {
            size_average: true,
            time_major: false,
            apply_log_softmax: false,
        }
    }
}

/// Result of a batch loss computation.
#[derive(Debug)]
pub struct LossOutput {
    /// Per-sequence negative log-likelihood, unscaled, or that sequence's
    /// error. Failed sequences contribute nothing to `total` and have a zero
    /// gradient slice.
    pub per_sequence: Vec<Result<f64>>,

    /// Gradient of `total` with respect to the emission input, in the
    /// input's layout. Padding rows are zero.
    pub gradient: Array3<f64>,

    /// Batch loss: mean of the successful sequences when `size_average`,
    /// otherwise their sum.
    pub total: f64,
}

/// Forward-backward CTC loss over ragged batches.
pub struct CtcLoss {
    alphabet: Alphabet,
    opts: LossOpts,
}

impl CtcLoss {
    pub fn new(alphabet: Alphabet, opts: LossOpts) -> Self {
        Self { alphabet, opts }
    }

    /// Compute the loss and gradient for a batch.
    ///
    /// `emissions` is `(batch, time, alphabet)` — or `(time, batch,
    /// alphabet)` under `time_major` — with per-sequence real lengths in
    /// `input_lengths`. `targets` holds all label sequences concatenated;
    /// `target_lengths` splits it per sequence.
    ///
    /// Configuration problems (shape disagreement, blank in a target) fail
    /// the whole call before any work starts. Per-sequence problems
    /// (infeasible alignment, non-finite emissions) land in that sequence's
    /// slot of [`LossOutput::per_sequence`].
    pub fn compute(
        &self,
        emissions: ArrayView3<'_, f64>,
        input_lengths: &[usize],
        targets: &[usize],
        target_lengths: &[usize],
    ) -> Result<LossOutput> {
        let time_major = self.opts.time_major;
        batch::validate_batch(&emissions, input_lengths, self.alphabet.size(), time_major)?;

        let (batch_size, _, _) = batch::batch_dims(&emissions, time_major);
        if target_lengths.len() != batch_size {
            return Err(Error::config(format!(
                "batch holds {batch_size} sequences but {} target lengths were provided",
                target_lengths.len()
            )));
        }
        let expected: usize = target_lengths.iter().sum();
        if expected != targets.len() {
            return Err(Error::config(format!(
                "target lengths sum to {expected} but {} labels were provided",
                targets.len()
            )));
        }
        if let Some(&label) = targets.iter().find(|&&l| l >= self.alphabet.size()) {
            return Err(Error::config(format!(
                "target label {label} is out of range for alphabet of size {}",
                self.alphabet.size()
            )));
        }
        if targets.contains(&self.alphabet.blank()) {
            return Err(Error::config("targets must not contain the blank symbol"));
        }

        // Normalize once up front when the caller hands over raw activations.
        let normalized: Option<Array3<f64>> = if self.opts.apply_log_softmax {
            let mut owned = emissions.to_owned();
            for lane in owned.lanes_mut(Axis(2)) {
                batch::log_softmax_lane(lane);
            }
            Some(owned)
        } else {
            None
        };
        let work = normalized.as_ref().map_or(emissions.view(), |owned| owned.view());

        // Per-sequence target slices out of the concatenated label buffer.
        let mut offsets = Vec::with_capacity(batch_size);
        let mut offset = 0;
        for &length in target_lengths {
            offsets.push(offset);
            offset += length;
        }

        let blank = self.alphabet.blank();
        let alphabet_size = self.alphabet.size();
        let outcomes = batch::run_per_sequence(batch_size, |i| -> Result<(f64, Array2<f64>)> {
            let view = batch::sequence_view(work.clone(), i, time_major);
            let length = input_lengths[i];
            batch::validate_sequence(&view, length, alphabet_size)?;
            let sequence = view.slice_move(s![..length, ..]);
            let sequence_targets = &targets[offsets[i]..offsets[i] + target_lengths[i]];
            sequence_loss(sequence, sequence_targets, blank)
        });

        let mut gradient = Array3::<f64>::zeros(emissions.raw_dim());
        let mut per_sequence = Vec::with_capacity(batch_size);
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok((loss, grad)) => {
                    let length = input_lengths[i];
                    if time_major {
                        gradient.slice_mut(s![..length, i, ..]).assign(&grad);
                    } else {
                        gradient.slice_mut(s![i, ..length, ..]).assign(&grad);
                    }
                    per_sequence.push(Ok(loss));
                }
                Err(err) => {
                    debug!(sequence = i, error = %err, "sequence failed, gradient zeroed");
                    per_sequence.push(Err(err));
                }
            }
        }

        let mut total: f64 = per_sequence
            .iter()
            .filter_map(|outcome| outcome.as_ref().ok())
            .sum();
        if self.opts.size_average && batch_size > 0 {
            let scale = 1.0 / batch_size as f64;
            total *= scale;
            gradient.mapv_inplace(|g| g * scale);
        }

        Ok(LossOutput {
            per_sequence,
            gradient,
            total,
        })
    }
}

/// Loss and gradient for one sequence. `log_probs` is `(time, alphabet)`
/// with padding already sliced away.
fn sequence_loss(
    log_probs: ArrayView2<'_, f64>,
    targets: &[usize],
    blank: usize,
) -> Result<(f64, Array2<f64>)> {
    let time = log_probs.nrows();
    let required = min_feasible_frames(targets);
    if time < required {
        return Err(Error::InfeasibleAlignment {
            required,
            available: time,
        });
    }
    if time == 0 {
        // Empty target against an empty sequence: one path with probability 1.
        return Ok((0.0, Array2::zeros(log_probs.raw_dim())));
    }

    let tables = compute_tables(&log_probs, targets, blank);
    if !tables.total.is_finite() {
        return Err(Error::ZeroProbabilityAlignment);
    }
    let gradient = gradient_from_tables(&log_probs, &tables);
    Ok((-tables.total, gradient))
}

/// The fewest frames that can carry `targets`: one per label, plus one
/// separating blank per adjacent repeated pair.
fn min_feasible_frames(targets: &[usize]) -> usize {
    let repeats = targets.windows(2).filter(|pair| pair[0] == pair[1]).count();
    targets.len() + repeats
}

/// Targets with the blank interleaved before, between, and after each label.
fn extend_targets(targets: &[usize], blank: usize) -> Vec<usize> {
    let mut extended = vec![blank; targets.len() * 2 + 1];
    for (i, &label) in targets.iter().enumerate() {
        extended[i * 2 + 1] = label;
    }
    extended
}

/// Scratch tables for one sequence, `(extended position, timestep)`.
struct SequenceTables {
    extended: Vec<usize>,
    log_alpha: Array2<f64>,
    log_beta: Array2<f64>,
    /// Total sequence log-likelihood, read off the terminal α entries.
    total: f64,
}

fn compute_tables(log_probs: &ArrayView2<'_, f64>, targets: &[usize], blank: usize) -> SequenceTables {
    let time = log_probs.nrows();
    let extended = extend_targets(targets, blank);
    let ext_len = extended.len();

    // The reachable window at timestep t: positions that can still complete
    // the sequence (lower bound) and that enough frames have passed to reach
    // (upper bound).
    let window = |t: usize| {
        let start = (ext_len as isize - 2 * (time - t) as isize).max(0) as usize;
        let end = (t * 2 + 2).min(ext_len);
        (start, end)
    };

    let mut log_alpha = Array2::from_elem((ext_len, time), f64::NEG_INFINITY);
    if time > 1 || ext_len == 1 {
        log_alpha[[0, 0]] = log_probs[[0, extended[0]]];
    }
    if ext_len > 1 {
        log_alpha[[1, 0]] = log_probs[[0, extended[1]]];
    }
    for t in 1..time {
        let (start, end) = window(t);
        for j in start..end {
            let label = extended[j];
            let mut score = log_alpha[[j, t - 1]];
            if j > 0 {
                score = log_sum_exp(score, log_alpha[[j - 1, t - 1]]);
                // Skipping two positions is legal only over a blank onto a
                // label that differs from the one two back.
                if label != blank && j >= 2 && extended[j - 2] != label {
                    score = log_sum_exp(score, log_alpha[[j - 2, t - 1]]);
                }
            }
            log_alpha[[j, t]] = score + log_probs[[t, label]];
        }
    }

    let total = if ext_len > 1 {
        log_sum_exp(
            log_alpha[[ext_len - 1, time - 1]],
            log_alpha[[ext_len - 2, time - 1]],
        )
    } else {
        log_alpha[[0, time - 1]]
    };

    // β excludes the emission at its own timestep, so α + β at any cell is a
    // complete-path log-probability.
    let mut log_beta = Array2::from_elem((ext_len, time), f64::NEG_INFINITY);
    if time > 1 || ext_len == 1 {
        log_beta[[ext_len - 1, time - 1]] = 0.0;
    }
    if ext_len > 1 {
        log_beta[[ext_len - 2, time - 1]] = 0.0;
    }
    for t in (0..time.saturating_sub(1)).rev() {
        let (start, end) = window(t);
        for j in start..end {
            let label = extended[j];
            let mut score = log_beta[[j, t + 1]] + log_probs[[t + 1, label]];
            if j + 1 < ext_len {
                score = log_sum_exp(
                    score,
                    log_beta[[j + 1, t + 1]] + log_probs[[t + 1, extended[j + 1]]],
                );
                if label != blank && j + 2 < ext_len && extended[j + 2] != label {
                    score = log_sum_exp(
                        score,
                        log_beta[[j + 2, t + 1]] + log_probs[[t + 1, extended[j + 2]]],
                    );
                }
            }
            log_beta[[j, t]] = score;
        }
    }

    SequenceTables {
        extended,
        log_alpha,
        log_beta,
        total,
    }
}

/// Gradient of the negative log-likelihood: output probability minus
/// posterior occupation probability, per frame and symbol.
fn gradient_from_tables(log_probs: &ArrayView2<'_, f64>, tables: &SequenceTables) -> Array2<f64> {
    let (time, alphabet_size) = log_probs.dim();
    let mut occupation = Array2::from_elem((time, alphabet_size), f64::NEG_INFINITY);
    for (j, &label) in tables.extended.iter().enumerate() {
        for t in 0..time {
            occupation[[t, label]] = log_sum_exp(
                occupation[[t, label]],
                tables.log_alpha[[j, t]] + tables.log_beta[[j, t]],
            );
        }
    }

    let mut gradient = Array2::zeros((time, alphabet_size));
    for t in 0..time {
        for k in 0..alphabet_size {
            gradient[[t, k]] =
                log_probs[[t, k]].exp() - (occupation[[t, k]] - tables.total).exp();
        }
    }
    gradient
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn char_alphabet() -> Alphabet {
        Alphabet::from_chars("-ab", 0).expect("alphabet")
    }

    fn log2d(rows: Vec<Vec<f64>>) -> Array2<f64> {
        let time = rows.len();
        let width = rows[0].len();
        Array2::from_shape_vec(
            (time, width),
            rows.into_iter().flatten().map(f64::ln).collect(),
        )
        .expect("rectangular rows")
    }

    #[test]
    fn single_frame_single_label_matches_cross_entropy() {
        // One frame, target "a": the loss is -log p(a) and the gradient is
        // the classic softmax-minus-one-hot.
        let log_probs = log2d(vec![vec![0.2, 0.5, 0.3]]);
        let (loss, grad) = sequence_loss(log_probs.view(), &[1], 0).expect("feasible");
        assert!((loss - -(0.5f64).ln()).abs() < 1e-12);
        assert!((grad[[0, 0]] - 0.2).abs() < 1e-12);
        assert!((grad[[0, 1]] - -0.5).abs() < 1e-12);
        assert!((grad[[0, 2]] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_target_is_the_all_blank_path() {
        let log_probs = log2d(vec![vec![0.6, 0.3, 0.1], vec![0.7, 0.2, 0.1]]);
        let (loss, grad) = sequence_loss(log_probs.view(), &[], 0).expect("feasible");
        let expected = -((0.6f64).ln() + (0.7f64).ln());
        assert!((loss - expected).abs() < 1e-12);
        // Gradient is p - 1 on the blank column, p elsewhere.
        assert!((grad[[0, 0]] - (0.6 - 1.0)).abs() < 1e-12);
        assert!((grad[[1, 0]] - (0.7 - 1.0)).abs() < 1e-12);
        assert!((grad[[0, 1]] - 0.3).abs() < 1e-12);
        assert!((grad[[1, 2]] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn forward_and_backward_totals_agree() {
        let log_probs = log2d(vec![
            vec![0.4, 0.35, 0.25],
            vec![0.1, 0.6, 0.3],
            vec![0.2, 0.3, 0.5],
            vec![0.55, 0.25, 0.2],
            vec![0.3, 0.5, 0.2],
        ]);
        let targets = [1, 2, 1];
        let tables = compute_tables(&log_probs.view(), &targets, 0);

        // Re-derive the total from β at t = 0 over the two valid starting
        // positions; it must match the α-derived total.
        let view = log_probs.view();
        let mut from_beta =
            tables.log_beta[[0, 0]] + view[[0, tables.extended[0]]];
        if tables.extended.len() > 1 {
            from_beta = log_sum_exp(
                from_beta,
                tables.log_beta[[1, 0]] + view[[0, tables.extended[1]]],
            );
        }
        assert!(tables.total.is_finite());
        assert!((tables.total - from_beta).abs() < 1e-9);
    }

    #[test]
    fn repeated_labels_need_a_separating_frame() {
        assert_eq!(min_feasible_frames(&[1, 1]), 3);
        assert_eq!(min_feasible_frames(&[1, 2, 1]), 3);
        assert_eq!(min_feasible_frames(&[1, 1, 1]), 5);
        assert_eq!(min_feasible_frames(&[]), 0);

        // Exactly enough frames is feasible, one less is not.
        let feasible = log2d(vec![
            vec![0.2, 0.8],
            vec![0.9, 0.1],
            vec![0.2, 0.8],
        ]);
        assert!(sequence_loss(feasible.view(), &[1, 1], 0).is_ok());

        let short = log2d(vec![vec![0.2, 0.8], vec![0.2, 0.8]]);
        let err = sequence_loss(short.view(), &[1, 1], 0).unwrap_err();
        assert!(matches!(
            err,
            Error::InfeasibleAlignment {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn gradient_sums_posterior_mass_over_blank_separated_repeats() {
        // Target "aa" over three frames has exactly one path: a, blank, a.
        let log_probs = log2d(vec![
            vec![0.3, 0.7],
            vec![0.6, 0.4],
            vec![0.5, 0.5],
        ]);
        let (loss, grad) = sequence_loss(log_probs.view(), &[1, 1], 0).expect("feasible");
        let expected = -((0.7f64).ln() + (0.6f64).ln() + (0.5f64).ln());
        assert!((loss - expected).abs() < 1e-12);
        // The single path fully occupies (0, a), (1, blank), (2, a).
        assert!((grad[[0, 1]] - (0.7 - 1.0)).abs() < 1e-12);
        assert!((grad[[1, 0]] - (0.6 - 1.0)).abs() < 1e-12);
        assert!((grad[[2, 1]] - (0.5 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn blank_in_targets_is_a_configuration_error() {
        let loss = CtcLoss::new(char_alphabet(), LossOpts::default());
        let emissions = Array3::from_elem((1, 3, 3), (1.0f64 / 3.0).ln());
        let err = loss
            .compute(emissions.view(), &[3], &[1, 0], &[2])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn infeasible_sequence_does_not_disturb_siblings() {
        let loss = CtcLoss::new(char_alphabet(), LossOpts { size_average: false, ..Default::default() });

        // Sequence 0 is fine; sequence 1 wants "aa" in two frames.
        let mut emissions = Array3::from_elem((2, 2, 3), (1.0f64 / 3.0).ln());
        emissions[[0, 0, 1]] = (0.5f64).ln();
        let output = loss
            .compute(emissions.view(), &[2, 2], &[1, 1, 1], &[1, 2])
            .expect("batch-level shape is fine");

        assert!(output.per_sequence[0].is_ok());
        assert!(matches!(
            output.per_sequence[1],
            Err(Error::InfeasibleAlignment { .. })
        ));
        // Failed slot's gradient slice is zero.
        assert!(output.gradient.slice(s![1, .., ..]).iter().all(|&g| g == 0.0));
        // Total counts only the surviving sequence.
        let survivor = output.per_sequence[0].as_ref().copied().expect("ok");
        assert!((output.total - survivor).abs() < 1e-12);
    }

    #[test]
    fn size_average_divides_total_and_gradient_by_batch() {
        let alphabet = char_alphabet();
        let mut emissions = Array3::zeros((2, 2, 3));
        let frame = log2d(vec![vec![0.2, 0.5, 0.3], vec![0.6, 0.2, 0.2]]);
        emissions.slice_mut(s![0, .., ..]).assign(&frame);
        emissions.slice_mut(s![1, .., ..]).assign(&frame);

        let summed = CtcLoss::new(alphabet.clone(), LossOpts { size_average: false, ..Default::default() })
            .compute(emissions.view(), &[2, 2], &[1, 1], &[1, 1])
            .expect("compute");
        let averaged = CtcLoss::new(alphabet, LossOpts { size_average: true, ..Default::default() })
            .compute(emissions.view(), &[2, 2], &[1, 1], &[1, 1])
            .expect("compute");

        assert!((summed.total / 2.0 - averaged.total).abs() < 1e-12);
        let ratio = summed.gradient[[0, 0, 1]] / averaged.gradient[[0, 0, 1]];
        assert!((ratio - 2.0).abs() < 1e-12);
    }

    #[test]
    fn time_major_matches_batch_major() {
        let alphabet = char_alphabet();
        let frame = log2d(vec![
            vec![0.2, 0.5, 0.3],
            vec![0.6, 0.2, 0.2],
            vec![0.1, 0.1, 0.8],
        ]);
        let mut batch_major = Array3::zeros((1, 3, 3));
        batch_major.slice_mut(s![0, .., ..]).assign(&frame);
        let time_major = batch_major.clone().permuted_axes([1, 0, 2]).to_owned();

        let a = CtcLoss::new(alphabet.clone(), LossOpts::default())
            .compute(batch_major.view(), &[3], &[1, 2], &[2])
            .expect("compute");
        let b = CtcLoss::new(alphabet, LossOpts { time_major: true, ..Default::default() })
            .compute(time_major.view(), &[3], &[1, 2], &[2])
            .expect("compute");

        let la = a.per_sequence[0].as_ref().copied().expect("ok");
        let lb = b.per_sequence[0].as_ref().copied().expect("ok");
        assert!((la - lb).abs() < 1e-12);
        assert!((a.gradient[[0, 1, 2]] - b.gradient[[1, 0, 2]]).abs() < 1e-12);
    }
}
