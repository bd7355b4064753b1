//! Ragged batch handling: layout, validation, and parallel dispatch.
//!
//! A batch is a dense `(batch, time, alphabet)` array — or `(time, batch,
//! alphabet)` when the caller works time-major — together with per-sequence
//! real lengths, since padding rows carry no meaning. Sequences are
//! independent, so batch-level entry points fan them out across a small
//! worker pool and collect per-sequence results over a channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use ndarray::{Array2, ArrayView2, ArrayView3, ArrayViewMut1, s};
use tracing::debug;

use crate::error::{Error, Result};

/// Batch dimensions, normalized to (batch, time, alphabet) regardless of layout.
pub(crate) fn batch_dims(emissions: &ArrayView3<f64>, time_major: bool) -> (usize, usize, usize) {
    let shape = emissions.shape();
    if time_major {
        (shape[1], shape[0], shape[2])
    } else {
        (shape[0], shape[1], shape[2])
    }
}

/// The emission matrix of one sequence, `(time, alphabet)`, padding included.
pub(crate) fn sequence_view(
    emissions: ArrayView3<'_, f64>,
    index: usize,
    time_major: bool,
) -> ArrayView2<'_, f64> {
    if time_major {
        emissions.slice_move(s![.., index, ..])
    } else {
        emissions.slice_move(s![index, .., ..])
    }
}

/// Validate batch-level shape agreement before any computation starts.
pub(crate) fn validate_batch(
    emissions: &ArrayView3<f64>,
    lengths: &[usize],
    alphabet_size: usize,
    time_major: bool,
) -> Result<()> {
    let (batch, time, alphabet) = batch_dims(emissions, time_major);
    if alphabet != alphabet_size {
        return Err(Error::config(format!(
            "emissions carry {alphabet} symbols but the alphabet has {alphabet_size}"
        )));
    }
    if lengths.len() != batch {
        return Err(Error::config(format!(
            "batch holds {batch} sequences but {} lengths were provided",
            lengths.len()
        )));
    }
    if let Some((index, &length)) = lengths.iter().enumerate().find(|&(_, &l)| l > time) {
        return Err(Error::config(format!(
            "sequence {index} claims {length} frames but storage has only {time}"
        )));
    }
    Ok(())
}

/// Validate one sequence's emission matrix.
///
/// Rejects an alphabet-size mismatch and any NaN or +inf entry within the
/// first `length` rows. `-inf` is a legal log-probability (exact zero) and
/// passes.
pub(crate) fn validate_sequence(
    log_probs: &ArrayView2<f64>,
    length: usize,
    alphabet_size: usize,
) -> Result<()> {
    let (time, alphabet) = log_probs.dim();
    if alphabet != alphabet_size {
        return Err(Error::config(format!(
            "emissions carry {alphabet} symbols but the alphabet has {alphabet_size}"
        )));
    }
    if length > time {
        return Err(Error::config(format!(
            "sequence claims {length} frames but storage has only {time}"
        )));
    }
    for (timestep, row) in log_probs.outer_iter().take(length).enumerate() {
        for (symbol, &value) in row.iter().enumerate() {
            if value.is_nan() || value == f64::INFINITY {
                return Err(Error::NonFiniteEmission { timestep, symbol });
            }
        }
    }
    Ok(())
}

/// Normalize one lane of activations to a log-probability distribution.
pub(crate) fn log_softmax_lane(mut lane: ArrayViewMut1<'_, f64>) {
    let max = lane.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let norm = max + lane.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
    lane.mapv_inplace(|v| v - norm);
}

/// Normalize each row to a log-probability distribution in place.
///
/// Used when the caller hands over raw activations instead of the output of
/// a log-softmax layer.
pub fn log_softmax_rows(activations: &mut Array2<f64>) {
    for row in activations.rows_mut() {
        log_softmax_lane(row);
    }
}

/// Run `task` once per sequence index and return the results in batch order.
///
/// Sequences are independent, so they are spread across up to `num_cpus`
/// worker threads; each worker claims the next unprocessed index and sends
/// its result back over a channel. Small batches skip the pool entirely.
pub(crate) fn run_per_sequence<T, F>(batch: usize, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if batch == 0 {
        return Vec::new();
    }
    let workers = num_cpus::get().min(batch);
    if workers <= 1 {
        return (0..batch).map(task).collect();
    }

    debug!(batch, workers, "dispatching batch across worker threads");
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, T)>();
    let mut results: Vec<(usize, T)> = std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let task = &task;
            scope.spawn(move || {
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    if index >= batch {
                        break;
                    }
                    if tx.send((index, task(index))).is_err() {
                        break;
                    }
                }
            });
        }
        // Drop the original sender so the receiver ends once workers finish.
        drop(tx);
        rx.into_iter().collect()
    });

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, value)| value).collect()
}
