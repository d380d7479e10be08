//! Per-gene models for pseudobulk differential expression.

pub mod dispersion;
pub mod lm;
pub mod nb;
pub mod ql;

pub use dispersion::{
    estimate_common_dispersion, estimate_tagwise_dispersion, MAX_DISPERSION, MIN_DISPERSION,
    TAGWISE_PRIOR_DF,
};
pub use lm::{model_lm, LmFit, LmFitSingle};
pub use nb::{
    fit_single_nb, model_nb, model_nb_genewise, nb_deviance, nb_unit_deviance, NbFit, NbFitSingle,
};
pub use ql::{fit_ql_prior, squeeze_dispersions, QlPrior};
