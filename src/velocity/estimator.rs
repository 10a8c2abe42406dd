//! The per-gene velocity estimator.

use std::borrow::Cow;

use ndarray::{Array1, Array2, ArrayView2};

use crate::data::{Dataset, VarColumn, mask_indices};
use crate::error::VelocityError;
use crate::moments::{MS_KEY, MU_KEY, MomentsProvider, SPLICED_KEY, UNSPLICED_KEY};
use crate::velocity::scope::FitScope;
use crate::velocity::solver::{solve_cov, solve2_inv, solve2_mle};
use crate::velocity::utils::{
    column_means, column_stds, first_order_residual, r_squared, velocity_gene_mask,
};
use crate::velocity::{FitMode, MleOptions};

/// Labels of the vectors returned by [`Velocity::pars`], in the same order.
pub const PAR_NAMES: [&str; 6] = ["_offset", "_offset2", "_beta", "_gamma", "_r2", "_genes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStage {
    Constructed,
    Deterministic,
    Stochastic,
}

/// Results of the deterministic stage, used to resume an estimator on a narrowed gene set
/// without fitting again.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicFit {
    pub residual: Array2<f32>,
    pub offset: Array1<f32>,
    pub gamma: Array1<f32>,
    pub r2: Array1<f32>,
}

impl DeterministicFit {
    /// Keep only the genes where `mask` is true.
    pub fn select_genes(&self, mask: &[bool]) -> DeterministicFit {
        let genes = mask_indices(mask);
        let pick = |v: &Array1<f32>| genes.iter().map(|&j| v[j]).collect::<Array1<f32>>();
        DeterministicFit {
            residual: self.residual.select(ndarray::Axis(1), &genes),
            offset: pick(&self.offset),
            gamma: pick(&self.gamma),
            r2: pick(&self.r2),
        }
    }
}

/// Velocity estimator over one cells × genes view.
///
/// The estimator borrows the dataset view for its lifetime and owns dense working copies of the
/// moments, residuals and per-gene parameters. Stages run in order
/// `Constructed → Deterministic → Stochastic`; [`compute_stochastic`](Self::compute_stochastic)
/// runs the deterministic stage itself if needed.
pub struct Velocity<'a> {
    data: &'a Dataset,
    ms: Array2<f32>,
    mu: Array2<f32>,
    scope: FitScope,
    residual: Option<Array2<f32>>,
    residual2: Option<Array2<f32>>,
    offset: Array1<f32>,
    offset2: Array1<f32>,
    beta: Array1<f32>,
    gamma: Array1<f32>,
    r2: Array1<f32>,
    velocity_genes: Vec<bool>,
    stage: FitStage,
}

impl<'a> Velocity<'a> {
    /// Set up an estimator on `data`.
    ///
    /// # Arguments
    ///
    /// * `data` - Dataset view with `Ms`/`Mu` layers (`spliced`/`unspliced` when `use_raw`)
    /// * `subset` - Optional cell mask restricting the rows of the deterministic regression
    /// * `use_raw` - Fit raw counts instead of first-order moments
    pub fn new(data: &'a Dataset, subset: Option<&[bool]>, use_raw: bool) -> anyhow::Result<Self> {
        let (s_key, u_key) = if use_raw {
            (SPLICED_KEY, UNSPLICED_KEY)
        } else {
            (MS_KEY, MU_KEY)
        };
        let ms = data.dense_layer(s_key)?;
        let mu = data.dense_layer(u_key)?;
        if ms.dim() != mu.dim() {
            return Err(VelocityError::ShapeMismatch {
                name: u_key.to_string(),
                expected: ms.dim(),
                found: mu.dim(),
            }
            .into());
        }

        let cells = match subset {
            Some(mask) => {
                if mask.len() != data.n_obs() {
                    return Err(VelocityError::configuration(format!(
                        "subset for fitting has length {}, expected {} cells",
                        mask.len(),
                        data.n_obs()
                    ))
                    .into());
                }
                let rows = mask_indices(mask);
                if rows.is_empty() {
                    return Err(
                        VelocityError::configuration("subset for fitting selects no cells").into(),
                    );
                }
                Some(rows)
            }
            None => None,
        };

        let n_vars = ms.ncols();
        Ok(Velocity {
            data,
            ms,
            mu,
            scope: FitScope::full(n_vars, cells),
            residual: None,
            residual2: None,
            offset: Array1::zeros(n_vars),
            offset2: Array1::zeros(n_vars),
            beta: Array1::ones(n_vars),
            gamma: Array1::zeros(n_vars),
            r2: Array1::zeros(n_vars),
            velocity_genes: vec![true; n_vars],
            stage: FitStage::Constructed,
        })
    }

    /// Set up an estimator that starts from an existing deterministic fit.
    ///
    /// `fit` must cover exactly the genes of `data`, typically a fit narrowed with
    /// [`DeterministicFit::select_genes`] after the dataset dropped non-velocity genes.
    pub fn resume(
        data: &'a Dataset,
        subset: Option<&[bool]>,
        fit: DeterministicFit,
        use_raw: bool,
    ) -> anyhow::Result<Self> {
        let mut velo = Velocity::new(data, subset, use_raw)?;
        if fit.residual.dim() != velo.ms.dim() {
            return Err(VelocityError::ShapeMismatch {
                name: "residual".to_string(),
                expected: velo.ms.dim(),
                found: fit.residual.dim(),
            }
            .into());
        }

        velo.velocity_genes = velocity_gene_mask(fit.r2.view(), fit.gamma.view());
        velo.residual = Some(fit.residual);
        velo.offset = fit.offset;
        velo.gamma = fit.gamma;
        velo.r2 = fit.r2;
        velo.stage = FitStage::Deterministic;
        Ok(velo)
    }

    /// Fit `Mu ≈ gamma·Ms [+ offset]` per gene.
    ///
    /// The regression uses the fitting cells of the scope; the residual and `r2` cover all cells.
    /// Re-running it replaces every result of earlier stages.
    pub fn compute_deterministic(&mut self, fit_offset: bool) {
        let (offset, gamma) = match self.scope.cells() {
            Some(_) => solve_cov(
                self.scope.gather_cells(self.ms.view()).view(),
                self.scope.gather_cells(self.mu.view()).view(),
                fit_offset,
            ),
            None => solve_cov(self.ms.view(), self.mu.view(), fit_offset),
        };

        let residual = first_order_residual(
            self.ms.view(),
            self.mu.view(),
            &gamma,
            fit_offset.then_some(&offset),
        );
        let total = &self.mu - &column_means(self.mu.view());
        self.r2 = r_squared(residual.view(), total.view());
        self.velocity_genes = velocity_gene_mask(self.r2.view(), gamma.view());

        self.offset = offset;
        self.gamma = gamma;
        self.offset2 = Array1::zeros(self.n_vars());
        self.residual = Some(residual);
        self.residual2 = None;
        self.stage = FitStage::Deterministic;

        log::debug!(
            "deterministic fit: {} of {} genes pass the velocity gene rule",
            self.velocity_genes.iter().filter(|&&g| g).count(),
            self.n_vars()
        );
    }

    /// Refine `gamma` and the offsets with second-order moments.
    ///
    /// Only the current velocity genes are refitted when they form a proper subset; parameters of
    /// the other genes keep their deterministic values and their second-order residual is zero.
    /// `FitMode::Bayes` uses the maximum-likelihood solver, any other mode the inverse-variance
    /// weighted one.
    pub fn compute_stochastic(
        &mut self,
        fit_offset: bool,
        fit_offset2: bool,
        mode: FitMode,
        moments: &dyn MomentsProvider,
        mle: &MleOptions,
    ) -> anyhow::Result<()> {
        if self.stage == FitStage::Constructed {
            self.compute_deterministic(fit_offset);
        }
        let scope = self.scope.with_genes(&self.velocity_genes);
        let residual = self
            .residual
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("First-order residual missing after deterministic fit"))?;

        let ms = scope.gather_genes(self.ms.view());
        let mu = scope.gather_genes(self.mu.view());
        let res_std = column_stds(scope.gather_genes(residual.view()).view());

        let view: Cow<Dataset> = if scope.is_proper_subset() {
            Cow::Owned(self.data.select_vars(scope.genes()))
        } else {
            Cow::Borrowed(self.data)
        };
        log::debug!(
            "stochastic fit on {} of {} genes",
            scope.genes().len(),
            scope.n_vars()
        );

        let (mss, mus) = moments.second_order_moments(&view)?;
        for (name, m) in [("Mss", &mss), ("Mus", &mus)] {
            if m.dim() != ms.dim() {
                return Err(VelocityError::ShapeMismatch {
                    name: name.to_string(),
                    expected: ms.dim(),
                    found: m.dim(),
                }
                .into());
            }
        }

        // second moments under Poisson noise
        let var_ss = &mss * 2.0 - &ms;
        let cov_us = &mus * 2.0 + &mu;

        let (offset2_seed, gamma2_seed) = solve_cov(var_ss.view(), cov_us.view(), fit_offset2);
        let res2_std = column_stds((&cov_us - &(&var_ss * &gamma2_seed) - &offset2_seed).view());

        let fitted = match mode {
            FitMode::Bayes => solve2_mle(
                ms.view(),
                mu.view(),
                mus.view(),
                mss.view(),
                fit_offset,
                fit_offset2,
                mle,
            ),
            FitMode::Stochastic | FitMode::Deterministic => solve2_inv(
                ms.view(),
                mu.view(),
                var_ss.view(),
                cov_us.view(),
                res_std.view(),
                res2_std.view(),
                fit_offset,
                fit_offset2,
            ),
        };

        scope.scatter(&mut self.offset, fitted.offset.view());
        scope.scatter(&mut self.offset2, fitted.offset2.view());
        scope.scatter(&mut self.gamma, fitted.gamma.view());

        self.residual = Some(first_order_residual(
            self.ms.view(),
            self.mu.view(),
            &self.gamma,
            fit_offset.then_some(&self.offset),
        ));

        let mut residual2 =
            (&cov_us - &(&ms * &mu * 2.0)) - &((&var_ss - &(&ms * &ms * 2.0)) * &fitted.gamma);
        if fit_offset {
            residual2 = residual2 + &(&ms * &fitted.offset * 2.0);
        }
        if fit_offset2 {
            residual2 = residual2 - &fitted.offset2;
        }
        self.residual2 = Some(scope.scatter_columns(residual2));
        self.stage = FitStage::Stochastic;
        Ok(())
    }

    /// First- and second-order residuals; `None` for stages that have not run.
    pub fn residuals(&self) -> (Option<&Array2<f32>>, Option<&Array2<f32>>) {
        (self.residual.as_ref(), self.residual2.as_ref())
    }

    /// `offset`, `offset2`, `beta`, `gamma`, `r2` and the velocity gene mask, labelled by
    /// [`PAR_NAMES`].
    pub fn pars(&self) -> [VarColumn; 6] {
        [
            VarColumn::Float(self.offset.to_vec()),
            VarColumn::Float(self.offset2.to_vec()),
            VarColumn::Float(self.beta.to_vec()),
            VarColumn::Float(self.gamma.to_vec()),
            VarColumn::Float(self.r2.to_vec()),
            VarColumn::Bool(self.velocity_genes.clone()),
        ]
    }

    pub fn par_names(&self) -> [&'static str; 6] {
        PAR_NAMES
    }

    /// Snapshot of the deterministic results, `None` before the deterministic stage.
    pub fn deterministic_fit(&self) -> Option<DeterministicFit> {
        self.residual.as_ref().map(|residual| DeterministicFit {
            residual: residual.clone(),
            offset: self.offset.clone(),
            gamma: self.gamma.clone(),
            r2: self.r2.clone(),
        })
    }

    pub fn velocity_genes(&self) -> &[bool] {
        &self.velocity_genes
    }

    pub fn gamma(&self) -> &Array1<f32> {
        &self.gamma
    }

    pub fn offset(&self) -> &Array1<f32> {
        &self.offset
    }

    pub fn offset2(&self) -> &Array1<f32> {
        &self.offset2
    }

    pub fn r2(&self) -> &Array1<f32> {
        &self.r2
    }

    pub fn stage(&self) -> FitStage {
        self.stage
    }

    pub fn scope(&self) -> &FitScope {
        &self.scope
    }

    pub fn n_vars(&self) -> usize {
        self.ms.ncols()
    }

    /// First-order moments the estimator works on.
    pub fn moments(&self) -> (ArrayView2<'_, f32>, ArrayView2<'_, f32>) {
        (self.ms.view(), self.mu.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Layer;
    use crate::moments::{MSS_KEY, MUS_KEY, PrecomputedMoments};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Genes 0 and 1 follow `Mu = 2·Ms`, gene 2 is anti-correlated.
    fn create_dataset() -> Dataset {
        let ms: Array2<f32> = array![[1.0, 2.0, 1.0], [2.0, 1.0, 3.0], [3.0, 4.0, 2.0], [4.0, 3.0, 4.0]];
        let mu: Array2<f32> = array![[2.1, 4.0, 3.0], [3.9, 2.1, 1.0], [6.0, 7.9, 2.0], [8.1, 6.0, 0.5]];
        let mss = (&ms * &ms + &ms) * 0.5;
        let mus = (&ms * &ms * 2.0 - &mu) * 0.5;

        Dataset::new(4, vec!["a".into(), "b".into(), "c".into()])
            .with_layer(MS_KEY, Layer::Dense(ms))
            .unwrap()
            .with_layer(MU_KEY, Layer::Dense(mu))
            .unwrap()
            .with_layer(MSS_KEY, Layer::Dense(mss))
            .unwrap()
            .with_layer(MUS_KEY, Layer::Dense(mus))
            .unwrap()
    }

    #[test]
    fn test_construction() {
        let data = create_dataset();
        let velo = Velocity::new(&data, None, false).unwrap();

        assert_eq!(velo.stage(), FitStage::Constructed);
        assert_eq!(velo.residuals(), (None, None));
        assert_eq!(velo.velocity_genes(), &[true, true, true]);
        let pars = velo.pars();
        assert_eq!(pars[2], VarColumn::Float(vec![1.0, 1.0, 1.0]));
        assert_eq!(velo.par_names()[3], "_gamma");

        let (ms, mu) = velo.moments();
        assert_eq!(ms, data.dense_layer(MS_KEY).unwrap());
        assert_eq!(mu, data.dense_layer(MU_KEY).unwrap());
        assert_eq!(velo.scope().genes(), &[0, 1, 2]);
        assert_eq!(velo.scope().cells(), None);
        assert!(!velo.scope().is_proper_subset());
    }

    #[test]
    fn test_deterministic_fit() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, None, false).unwrap();
        velo.compute_deterministic(false);

        assert_eq!(velo.stage(), FitStage::Deterministic);
        assert_abs_diff_eq!(velo.gamma()[0], 2.0, epsilon = 0.05);
        assert_abs_diff_eq!(velo.gamma()[1], 2.0, epsilon = 0.05);
        assert!(velo.r2()[0] > 0.9);
        assert_eq!(velo.velocity_genes(), &[true, true, false]);

        let (residual, residual2) = velo.residuals();
        assert_eq!(residual.unwrap().dim(), (4, 3));
        assert!(residual2.is_none());
    }

    #[test]
    fn test_deterministic_fit_is_idempotent() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, None, false).unwrap();
        velo.compute_deterministic(true);
        let first = velo.deterministic_fit().unwrap();
        velo.compute_deterministic(true);
        assert_eq!(velo.deterministic_fit().unwrap(), first);
    }

    #[test]
    fn test_fitting_subset_restricts_regression_rows() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, Some(&[true, true, false, false]), false).unwrap();
        velo.compute_deterministic(false);

        // gene 2 on the first two cells: Σxy / Σx² = (3 + 3) / (1 + 9)
        assert_abs_diff_eq!(velo.gamma()[2], 0.6, epsilon = 1e-5);
        // residual still covers every cell
        assert_eq!(velo.residuals().0.unwrap().nrows(), 4);
        assert_eq!(velo.scope().cells(), Some(&[0usize, 1][..]));
    }

    #[test]
    fn test_invalid_subset() {
        let data = create_dataset();
        assert!(Velocity::new(&data, Some(&[true]), false).is_err());
        assert!(Velocity::new(&data, Some(&[false; 4]), false).is_err());
    }

    #[test]
    fn test_stochastic_fit_on_gene_subset() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, None, false).unwrap();
        velo.compute_deterministic(false);
        let deterministic = velo.deterministic_fit().unwrap();

        velo.compute_stochastic(
            false,
            false,
            FitMode::Stochastic,
            &PrecomputedMoments,
            &MleOptions::default(),
        )
        .unwrap();

        assert_eq!(velo.stage(), FitStage::Stochastic);
        assert_abs_diff_eq!(velo.gamma()[0], 2.0, epsilon = 0.05);
        // gene outside the velocity genes keeps its deterministic parameters
        assert_eq!(velo.gamma()[2], deterministic.gamma[2]);
        assert_eq!(velo.offset2()[2], 0.0);

        let residual2 = velo.residuals().1.unwrap();
        assert_eq!(residual2.dim(), (4, 3));
        assert!(residual2.column(2).iter().all(|&v| v == 0.0));
        assert!(residual2.column(0).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_stochastic_runs_deterministic_first() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, None, false).unwrap();
        velo.compute_stochastic(
            false,
            false,
            FitMode::Bayes,
            &PrecomputedMoments,
            &MleOptions::default(),
        )
        .unwrap();
        assert_eq!(velo.stage(), FitStage::Stochastic);
        assert!(velo.r2()[0] > 0.9);
        assert_eq!(velo.velocity_genes(), &[true, true, false]);
    }

    #[test]
    fn test_resume_from_narrowed_fit() {
        let data = create_dataset();
        let mut velo = Velocity::new(&data, None, false).unwrap();
        velo.compute_deterministic(false);
        let mask = velo.velocity_genes().to_vec();
        let fit = velo.deterministic_fit().unwrap().select_genes(&mask);

        let narrowed = data.subset_vars(&mask).unwrap();
        let resumed = Velocity::resume(&narrowed, None, fit.clone(), false).unwrap();
        assert_eq!(resumed.stage(), FitStage::Deterministic);
        assert_eq!(resumed.velocity_genes(), &[true, true]);
        assert_eq!(resumed.gamma(), &fit.gamma);

        // a fit for the wrong gene count is rejected
        let wrong = velo.deterministic_fit().unwrap();
        assert!(Velocity::resume(&narrowed, None, wrong, false).is_err());
    }

    #[test]
    fn test_residuals_follow_moment_expansion() {
        let data = create_dataset();
        let ms = data.dense_layer(MS_KEY).unwrap();
        let mu = data.dense_layer(MU_KEY).unwrap();
        let mss = data.dense_layer(MSS_KEY).unwrap();
        let mus = data.dense_layer(MUS_KEY).unwrap();

        for (fit_offset, fit_offset2) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut velo = Velocity::new(&data, None, false).unwrap();
            velo.compute_stochastic(
                fit_offset,
                fit_offset2,
                FitMode::Stochastic,
                &PrecomputedMoments,
                &MleOptions::default(),
            )
            .unwrap();
            assert_eq!(velo.velocity_genes(), &[true, true, false]);

            let (residual, residual2) = velo.residuals();
            let (residual, residual2) = (residual.unwrap(), residual2.unwrap());
            for j in 0..3 {
                let gamma = velo.gamma()[j];
                let offset = velo.offset()[j];
                let offset2 = velo.offset2()[j];
                if !fit_offset {
                    assert_eq!(offset, 0.0);
                }
                if !fit_offset2 {
                    assert_eq!(offset2, 0.0);
                }

                for i in 0..4 {
                    let (s, u) = (ms[[i, j]], mu[[i, j]]);
                    let mut expected = u - gamma * s;
                    if fit_offset {
                        expected -= offset;
                    }
                    assert_abs_diff_eq!(residual[[i, j]], expected, epsilon = 1e-4);

                    let expected2 = if j < 2 {
                        let var_ss = 2.0 * mss[[i, j]] - s;
                        let cov_us = 2.0 * mus[[i, j]] + u;
                        let mut r = (cov_us - 2.0 * s * u) - gamma * (var_ss - 2.0 * s * s);
                        if fit_offset {
                            r += 2.0 * offset * s;
                        }
                        if fit_offset2 {
                            r -= offset2;
                        }
                        r
                    } else {
                        0.0
                    };
                    assert_abs_diff_eq!(residual2[[i, j]], expected2, epsilon = 1e-3);
                }
            }
        }
    }
}
