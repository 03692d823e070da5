use crate::error::ScoreInputError;

/// Nash-Sutcliffe efficiency of `simulated` against `observed`:
/// `1 - Σ(obs - sim)² / Σ(obs - mean(obs))²`. 1.0 is a perfect fit.
pub fn nash_sutcliffe(simulated: &[f64], observed: &[f64]) -> Result<f64, ScoreInputError> {
    if simulated.len() != observed.len() {
        return Err(ScoreInputError::LengthMismatch {
            simulated: simulated.len(),
            observed: observed.len(),
        });
    }
    if observed.is_empty() {
        return Err(ScoreInputError::Empty);
    }
    if let Some(index) = simulated.iter().position(|v| !v.is_finite()) {
        return Err(ScoreInputError::NonFinite { index });
    }
    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
    let variance: f64 = observed.iter().map(|o| (o - mean).powi(2)).sum();
    if variance == 0.0 || !variance.is_finite() {
        return Err(ScoreInputError::DegenerateObservations);
    }
    let residual: f64 = observed
        .iter()
        .zip(simulated)
        .map(|(o, s)| (o - s).powi(2))
        .sum();
    Ok(1.0 - residual / variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_fit_scores_one() {
        assert_eq!(nash_sutcliffe(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), Ok(1.0));
    }

    #[test]
    fn mean_prediction_scores_zero() {
        let score = nash_sutcliffe(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!(score.abs() < 1e-12);
    }

    #[test]
    fn worse_than_mean_is_negative() {
        // residual 8, variance 2
        let score = nash_sutcliffe(&[3.0, 2.0, 1.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!((score + 3.0).abs() < 1e-12);
    }

    #[test]
    fn constant_observations_are_rejected() {
        assert_eq!(
            nash_sutcliffe(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]),
            Err(ScoreInputError::DegenerateObservations)
        );
    }

    #[test]
    fn length_mismatch_and_empty_are_rejected() {
        assert_eq!(
            nash_sutcliffe(&[1.0, 2.0], &[1.0, 2.0, 3.0]),
            Err(ScoreInputError::LengthMismatch {
                simulated: 2,
                observed: 3
            })
        );
        assert_eq!(nash_sutcliffe(&[], &[]), Err(ScoreInputError::Empty));
    }

    #[test]
    fn non_finite_simulation_is_rejected() {
        assert_eq!(
            nash_sutcliffe(&[1.0, f64::NAN, 3.0], &[1.0, 2.0, 3.0]),
            Err(ScoreInputError::NonFinite { index: 1 })
        );
    }
}
