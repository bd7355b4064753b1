use lattice::Error;
use lattice::alphabet::Alphabet;
use lattice::loss::{CtcLoss, LossOpts};
use ndarray::{Array2, Array3, s};

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

fn single_sequence(frames: Array2<f64>) -> Array3<f64> {
    let (time, width) = frames.dim();
    let mut emissions = Array3::zeros((1, time, width));
    emissions.slice_mut(s![0, .., ..]).assign(&frames);
    emissions
}

#[test]
fn loss_matches_enumerated_path_mass() -> anyhow::Result<()> {
    // Two frames over {blank, a}, target "a". The three paths that collapse
    // to "a" carry 0.2*0.6 + 0.8*0.4 + 0.2*0.4 = 0.52 of the mass.
    let alphabet = Alphabet::from_chars("-a", 0)?;
    let emissions = single_sequence(log2d(vec![vec![0.8, 0.2], vec![0.6, 0.4]]));

    let loss = CtcLoss::new(alphabet, LossOpts::default());
    let output = loss.compute(emissions.view(), &[2], &[1], &[1])?;
    let value = output.per_sequence[0].as_ref().copied().expect("feasible");
    assert!((value - -(0.52f64).ln()).abs() < 1e-12);
    Ok(())
}

#[test]
fn analytic_gradient_matches_finite_differences() -> anyhow::Result<()> {
    // Raw activations, normalized internally; the analytic gradient is with
    // respect to these pre-softmax values, so plain central differences on
    // the activations must reproduce it.
    let logits = Array2::from_shape_vec(
        (4, 3),
        vec![
            0.3, -0.8, 1.1, //
            0.9, 0.4, -0.2, //
            -1.0, 0.6, 0.1, //
            0.2, -0.3, 0.5,
        ],
    )?;
    let targets = [1usize, 2];

    let loss = CtcLoss::new(
        char_alphabet(),
        LossOpts {
            apply_log_softmax: true,
            ..Default::default()
        },
    );
    let total_of = |activations: &Array2<f64>| -> anyhow::Result<f64> {
        let emissions = single_sequence(activations.clone());
        let output = loss.compute(emissions.view(), &[4], &targets, &[2])?;
        Ok(output.total)
    };

    let output = loss.compute(single_sequence(logits.clone()).view(), &[4], &targets, &[2])?;
    let epsilon = 1e-5;
    for t in 0..4 {
        for k in 0..3 {
            let mut perturbed = logits.clone();
            perturbed[[t, k]] += epsilon;
            let up = total_of(&perturbed)?;
            perturbed[[t, k]] -= 2.0 * epsilon;
            let down = total_of(&perturbed)?;

            let numerical = (up - down) / (2.0 * epsilon);
            let analytic = output.gradient[[0, t, k]];
            assert!(
                (numerical - analytic).abs() < 1e-6,
                "gradient mismatch at ({t}, {k}): numerical {numerical}, analytic {analytic}"
            );
        }
    }
    Ok(())
}

#[test]
fn empty_target_scores_the_all_blank_path() -> anyhow::Result<()> {
    let emissions = single_sequence(log2d(vec![
        vec![0.7, 0.2, 0.1],
        vec![0.6, 0.3, 0.1],
    ]));
    let loss = CtcLoss::new(char_alphabet(), LossOpts::default());
    let output = loss.compute(emissions.view(), &[2], &[], &[0])?;
    let value = output.per_sequence[0].as_ref().copied().expect("feasible");
    assert!((value - -((0.7f64).ln() + (0.6f64).ln())).abs() < 1e-12);
    Ok(())
}

#[test]
fn repeated_labels_hit_the_feasibility_boundary() -> anyhow::Result<()> {
    let alphabet = Alphabet::from_chars("-a", 0)?;
    let loss = CtcLoss::new(alphabet, LossOpts::default());

    // "aa" fits in 3 frames (a, blank, a)...
    let enough = single_sequence(log2d(vec![
        vec![0.3, 0.7],
        vec![0.6, 0.4],
        vec![0.2, 0.8],
    ]));
    let output = loss.compute(enough.view(), &[3], &[1, 1], &[2])?;
    let value = output.per_sequence[0].as_ref().copied().expect("feasible");
    assert!(value.is_finite());

    // ...but not in 2: there is no room for the separating blank.
    let short = single_sequence(log2d(vec![vec![0.3, 0.7], vec![0.6, 0.4]]));
    let output = loss.compute(short.view(), &[2], &[1, 1], &[2])?;
    assert!(matches!(
        output.per_sequence[0],
        Err(Error::InfeasibleAlignment {
            required: 3,
            available: 2
        })
    ));
    // The failed slot's gradient stays zero.
    assert!(output.gradient.iter().all(|&g| g == 0.0));
    Ok(())
}

#[test]
fn nan_emissions_are_rejected_per_sequence() -> anyhow::Result<()> {
    let mut emissions = single_sequence(log2d(vec![
        vec![0.7, 0.2, 0.1],
        vec![0.6, 0.3, 0.1],
    ]));
    emissions[[0, 1, 2]] = f64::NAN;

    let loss = CtcLoss::new(char_alphabet(), LossOpts::default());
    let output = loss.compute(emissions.view(), &[2], &[1], &[1])?;
    assert!(matches!(
        output.per_sequence[0],
        Err(Error::NonFiniteEmission {
            timestep: 1,
            symbol: 2
        })
    ));
    Ok(())
}

#[test]
fn mismatched_alphabet_size_fails_before_any_work() -> anyhow::Result<()> {
    // Four emission columns against a three-symbol alphabet.
    let emissions = Array3::from_elem((1, 2, 4), (0.25f64).ln());
    let loss = CtcLoss::new(char_alphabet(), LossOpts::default());
    let err = loss
        .compute(emissions.view(), &[2], &[1], &[1])
        .expect_err("must reject the shape");
    assert!(matches!(err, Error::Configuration(_)));
    Ok(())
}
