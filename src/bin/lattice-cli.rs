use std::fs::File;
use std::io::{self, BufReader, BufWriter};

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use ndarray::Array2;
use serde::Deserialize;

use lattice::alphabet::Alphabet;
use lattice::beam::{BeamSearchDecoder, BeamSearchOpts};
use lattice::greedy::GreedyDecoder;
use lattice::hypothesis_encoder::HypothesisEncoder;
use lattice::json_array_encoder::JsonArrayEncoder;
use lattice::logging;

fn main() -> Result<()> {
    logging::init();
    let params = Params::parse();

    let emissions = read_emissions(&params.emissions_path)?;
    let alphabet = Alphabet::new(emissions.labels, emissions.blank)?;
    let matrix = to_matrix(emissions.log_probs, alphabet.size())?;

    let hypotheses = match params.mode {
        Mode::Greedy => vec![GreedyDecoder::new(alphabet).decode(matrix.view())?],
        Mode::Beam => {
            let opts = BeamSearchOpts {
                beam_width: params.beam_width,
                num_results: params.num_results,
                word_bonus: params.word_bonus,
                pruning_threshold: params.pruning_threshold,
                ..Default::default()
            };
            BeamSearchDecoder::new(alphabet, opts)?.decode(matrix.view())?
        }
    };

    let stdout = io::stdout();
    let writer = BufWriter::new(stdout.lock());
    let mut encoder = JsonArrayEncoder::new(writer);
    for hypothesis in &hypotheses {
        encoder.write_hypothesis(hypothesis)?;
    }
    encoder.close()?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "lattice")]
#[command(about = "Decode CTC emissions from a JSON file")]
struct Params {
    /// JSON file with {labels, blank, log_probs}.
    #[arg(short = 'e', long = "emissions")]
    pub emissions_path: String,

    #[arg(short = 'm', long = "mode", value_enum, default_value_t = Mode::Greedy)]
    pub mode: Mode,

    #[arg(long = "beam-width", default_value_t = 64)]
    pub beam_width: usize,

    #[arg(short = 'n', long = "num-results", default_value_t = 1)]
    pub num_results: usize,

    #[arg(long = "word-bonus", default_value_t = 0.0)]
    pub word_bonus: f64,

    #[arg(long = "pruning-threshold", default_value_t = 0.0)]
    pub pruning_threshold: f64,
}

#[derive(Debug, Clone, ValueEnum)]
enum Mode {
    /// Arg-max decoding, one hypothesis.
    Greedy,

    /// Prefix beam search, top-N hypotheses.
    Beam,
}

/// On-disk emission format: a label list, the blank index, and one row of
/// log-probabilities per timestep.
#[derive(Debug, Deserialize)]
struct EmissionsFile {
    labels: Vec<String>,
    blank: usize,
    log_probs: Vec<Vec<f64>>,
}

fn read_emissions(path: &str) -> Result<EmissionsFile> {
    let file = File::open(path).with_context(|| format!("failed to open '{path}'"))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse emissions from '{path}'"))
}

fn to_matrix(rows: Vec<Vec<f64>>, width: usize) -> Result<Array2<f64>> {
    let time = rows.len();
    for (t, row) in rows.iter().enumerate() {
        ensure!(
            row.len() == width,
            "frame {t} has {} entries, expected {width}",
            row.len()
        );
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((time, width), flat).context("emissions are not rectangular")
}
