//! RNA velocity estimation from first- and second-order moments.
//!
//! Velocities are residuals of a steady-state regression of unspliced on spliced abundance,
//! fitted gene by gene. The pipeline has two stages:
//!
//! - **Deterministic**: `Mu ≈ gamma·Ms [+ offset]` on first-order moments.
//! - **Stochastic**: a joint fit that also uses second-order moments, restricted to the genes that
//!   passed the deterministic stage. `Bayes` refines it with an iterative maximum-likelihood
//!   solver that accounts for parameter-dependent noise.
//!
//! ## Entry points
//!
//! - [`velocity`]: the driver; fits a [`Dataset`](crate::data::Dataset) and writes layers and gene
//!   annotations back according to a [`VelocityConfig`].
//! - [`Velocity`]: the estimator itself, for callers that manage results on their own.
//! - [`solver`]: the column-wise regression primitives.

use std::fmt;
use std::str::FromStr;

use crate::error::VelocityError;

pub mod driver;
pub mod estimator;
pub mod scope;
pub mod solver;
pub mod utils;

pub use driver::velocity;
pub use estimator::{DeterministicFit, FitStage, Velocity};
pub use scope::FitScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// First-order moments only
    #[default]
    Deterministic,
    /// First- and second-order moments, inverse-variance weighted
    Stochastic,
    /// Stochastic model solved by iterative maximum likelihood
    Bayes,
}

impl FitMode {
    /// Whether the mode runs the second-order stage.
    pub fn is_stochastic(&self) -> bool {
        matches!(self, FitMode::Stochastic | FitMode::Bayes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FitMode::Deterministic => "deterministic",
            FitMode::Stochastic => "stochastic",
            FitMode::Bayes => "bayes",
        }
    }
}

impl FromStr for FitMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deterministic" => Ok(FitMode::Deterministic),
            "stochastic" => Ok(FitMode::Stochastic),
            "bayes" => Ok(FitMode::Bayes),
            other => Err(VelocityError::configuration(format!(
                "unknown fitting mode '{}', expected 'deterministic', 'stochastic' or 'bayes'",
                other
            ))
            .into()),
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cells to fit, given as labels of a per-cell grouping annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSelection {
    /// Group labels to keep
    pub groups: Vec<String>,
    /// Annotation holding the labels. Falls back to `clusters`, then `louvain`.
    pub groupby: Option<String>,
}

impl GroupSelection {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupSelection {
            groups: groups.into_iter().map(Into::into).collect(),
            groupby: None,
        }
    }

    pub fn with_groupby(mut self, groupby: &str) -> Self {
        self.groupby = Some(groupby.to_string());
        self
    }
}

/// Stopping rule of the maximum-likelihood solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MleOptions {
    pub max_iter: usize,
    /// Largest relative parameter change accepted as converged
    pub tol: f64,
}

impl Default for MleOptions {
    fn default() -> Self {
        MleOptions {
            max_iter: 100,
            tol: 1e-6,
        }
    }
}

/// Settings of one [`velocity`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityConfig {
    /// Key of the velocity layer and prefix of the gene annotations
    pub vkey: String,
    pub mode: FitMode,
    /// Fit an offset for the first-order regression
    pub fit_offset: bool,
    /// Fit an offset for the second-order regression
    pub fit_offset2: bool,
    /// Drop genes that fail the velocity-gene rule
    pub filter_genes: bool,
    pub groups: Option<GroupSelection>,
    /// Cells (of the group-restricted view) used for the deterministic regression
    pub subset_for_fitting: Option<Vec<bool>>,
    /// Fit raw `spliced`/`unspliced` counts instead of `Ms`/`Mu`
    pub use_raw: bool,
    /// Work on a copy and return it instead of modifying the input
    pub copy: bool,
    pub mle: MleOptions,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        VelocityConfig {
            vkey: "velocity".to_string(),
            mode: FitMode::Deterministic,
            fit_offset: false,
            fit_offset2: false,
            filter_genes: false,
            groups: None,
            subset_for_fitting: None,
            use_raw: false,
            copy: false,
            mle: MleOptions::default(),
        }
    }
}

impl VelocityConfig {
    pub fn new(mode: FitMode) -> Self {
        VelocityConfig {
            mode,
            ..Default::default()
        }
    }

    pub fn with_vkey(mut self, vkey: &str) -> Self {
        self.vkey = vkey.to_string();
        self
    }

    pub fn with_fit_offset(mut self, fit_offset: bool) -> Self {
        self.fit_offset = fit_offset;
        self
    }

    pub fn with_fit_offset2(mut self, fit_offset2: bool) -> Self {
        self.fit_offset2 = fit_offset2;
        self
    }

    pub fn with_filter_genes(mut self, filter_genes: bool) -> Self {
        self.filter_genes = filter_genes;
        self
    }

    pub fn with_groups(mut self, groups: GroupSelection) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_subset_for_fitting(mut self, subset: Vec<bool>) -> Self {
        self.subset_for_fitting = Some(subset);
        self
    }

    pub fn with_use_raw(mut self, use_raw: bool) -> Self {
        self.use_raw = use_raw;
        self
    }

    pub fn with_copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    pub fn with_mle(mut self, mle: MleOptions) -> Self {
        self.mle = mle;
        self
    }

    /// Key of the second-order residual layer.
    pub fn variance_key(&self) -> String {
        format!("variance_{}", self.vkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("stochastic".parse::<FitMode>().unwrap(), FitMode::Stochastic);
        assert_eq!("Bayes".parse::<FitMode>().unwrap(), FitMode::Bayes);
        assert_eq!(
            "deterministic".parse::<FitMode>().unwrap(),
            FitMode::Deterministic
        );

        let err = "dynamical".parse::<FitMode>().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VelocityError>(),
            Some(VelocityError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config = VelocityConfig::default();
        assert_eq!(config.vkey, "velocity");
        assert_eq!(config.variance_key(), "variance_velocity");
        assert_eq!(config.mode, FitMode::Deterministic);
        assert!(!config.mode.is_stochastic());

        let config = VelocityConfig::new(FitMode::Bayes).with_vkey("velo");
        assert!(config.mode.is_stochastic());
        assert_eq!(config.variance_key(), "variance_velo");
    }
}
