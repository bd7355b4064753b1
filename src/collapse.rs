//! Path collapsing: raw per-timestep symbol paths to label sequences.
//!
//! CTC emits one symbol per timestep; the label sequence is obtained by
//! dropping blanks and merging consecutive repeats. Greedy decoding and beam
//! hypothesis finalization both collapse through these functions, so the two
//! strategies agree on what a path "means".

/// Collapse a raw symbol path: remove blanks, merge consecutive duplicates.
///
/// A repeated label separated by a blank stays two labels; an unseparated
/// repeat collapses to one.
pub fn collapse_path(path: &[usize], blank: usize) -> Vec<usize> {
    collapse_path_with_steps(path, blank)
        .into_iter()
        .map(|(label, _)| label)
        .collect()
}

/// Collapse a raw symbol path, keeping for each emitted label the timestep
/// of its first occurrence in the path.
pub fn collapse_path_with_steps(path: &[usize], blank: usize) -> Vec<(usize, usize)> {
    let mut collapsed = Vec::new();
    let mut last = blank;
    for (timestep, &symbol) in path.iter().enumerate() {
        if symbol != blank && symbol != last {
            collapsed.push((symbol, timestep));
        }
        last = symbol;
    }
    collapsed
}
