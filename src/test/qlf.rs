//! Quasi-likelihood F-test for a contrast.
//!
//! The deviance difference between the reduced and full fits is scaled by
//! the gene's squeezed quasi-likelihood dispersion and referred to an F
//! distribution with `d0 + df_residual` denominator degrees of freedom.

use crate::error::{PbdsError, Result};
use crate::model::{squeeze_dispersions, NbFit, QlPrior};
use crate::test::lrt::check_nested;
use crate::test::{degenerate, ContrastTestResult, ContrastTestSingle, TestMethod, DEV_TOL};
use nalgebra::DVector;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use tracing::debug;

/// Perform the QL F-test for a contrast on negative binomial fits.
///
/// # Arguments
/// * `full` - Fit of the full design
/// * `reduced` - Fit of the null design (contrast constrained to zero)
/// * `contrast` - Contrast vector over the full design's coefficients
///
/// # Returns
/// The fitted QL prior and a ContrastTestResult with F statistics.
pub fn test_qlf(
    full: &NbFit,
    reduced: &NbFit,
    contrast: &DVector<f64>,
) -> Result<(QlPrior, ContrastTestResult)> {
    let df_test = check_nested(full, reduced)? as f64;
    if full.df_residual == 0 {
        return Err(PbdsError::Numerical(
            "QL F-test needs residual degrees of freedom".to_string(),
        ));
    }
    let df = full.df_residual as f64;

    let s_sq: Vec<f64> = full.fits.iter().map(|f| f.deviance / df).collect();
    let (prior, posterior) = squeeze_dispersions(&s_sq, df);
    debug!(d0 = prior.d0, s0_sq = prior.s0_sq, "QL prior");

    let results = full
        .fits
        .iter()
        .zip(&reduced.fits)
        .zip(&posterior)
        .map(|((f, r), &s_post)| {
            let estimate = f.contrast_estimate(contrast);
            let lr = r.deviance - f.deviance;

            let (statistic, p_value) = if !lr.is_finite() || !s_post.is_finite() {
                (f64::NAN, f64::NAN)
            } else if lr <= DEV_TOL {
                (0.0, 1.0)
            } else if s_post <= 0.0 {
                degenerate(lr)
            } else {
                let statistic = lr / df_test / s_post;
                let p_value = f_p_value(statistic, df_test, prior.df_total(df))?;
                (statistic, p_value)
            };

            Ok(ContrastTestSingle {
                gene_id: f.gene_id.clone(),
                estimate,
                statistic,
                p_value,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((
        prior,
        ContrastTestResult {
            results,
            method: TestMethod::QuasiLikelihoodF.name().to_string(),
        },
    ))
}

/// Upper tail of F(df1, df2); chi-squared limit when `df2` is infinite.
fn f_p_value(statistic: f64, df1: f64, df2: f64) -> Result<f64> {
    if df2.is_infinite() {
        let chi_sq = ChiSquared::new(df1)
            .map_err(|e| PbdsError::Numerical(format!("Chi-squared distribution: {}", e)))?;
        return Ok(chi_sq.sf(statistic * df1));
    }
    let f_dist = FisherSnedecor::new(df1, df2)
        .map_err(|e| PbdsError::Numerical(format!("F distribution: {}", e)))?;
    Ok(f_dist.sf(statistic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::lrt::tests::create_fits;
    use approx::assert_relative_eq;

    #[test]
    fn test_qlf_detects_changes() {
        let (full, reduced, contrast) = create_fits();
        let (prior, result) = test_qlf(&full, &reduced, &contrast).unwrap();

        assert_eq!(result.method, "quasi_likelihood_f");
        assert!(prior.d0 >= 0.0);

        let up = result.get_gene("up").unwrap();
        assert!(up.estimate > 1.0);
        assert!(up.p_value < 0.01);

        let down = result.get_gene("down").unwrap();
        assert!(down.estimate < -1.0);
        assert!(down.p_value < 0.01);

        let flat = result.get_gene("flat").unwrap();
        assert!(flat.p_value > 0.2);
    }

    #[test]
    fn test_f_p_value() {
        // chi-squared(1) 95% quantile
        assert_relative_eq!(f_p_value(3.841458820694124, 1.0, f64::INFINITY).unwrap(), 0.05, epsilon = 1e-6);
        // F(1, 10) 95% quantile
        assert_relative_eq!(f_p_value(4.964602743730711, 1.0, 10.0).unwrap(), 0.05, epsilon = 1e-6);
        assert_relative_eq!(f_p_value(0.0, 1.0, 10.0).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rounding_level_deviance_not_significant() {
        // exact fits: zero residual deviance and a rounding-level drop
        let (mut full, mut reduced, contrast) = create_fits();
        for f in &mut full.fits {
            f.deviance = 0.0;
        }
        for r in &mut reduced.fits {
            r.deviance = 1e-12;
        }
        let (_, result) = test_qlf(&full, &reduced, &contrast).unwrap();
        for r in &result.results {
            assert_eq!(r.statistic, 0.0);
            assert_eq!(r.p_value, 1.0);
        }

        reduced.fits[0].deviance = 5.0;
        let (_, result) = test_qlf(&full, &reduced, &contrast).unwrap();
        assert_eq!(result.results[0].p_value, 0.0);
    }
}
