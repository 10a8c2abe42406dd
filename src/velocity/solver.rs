//! Column-wise regression primitives for kinetic parameter estimation.
//!
//! Every solver fits all genes at once, one independent regression per column, from moment
//! statistics (sums, covariances) rather than by pointwise least squares. Accumulation happens in
//! double precision; results are returned in single precision like the expression data.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::velocity::MleOptions;
use crate::velocity::utils::column_stds;

/// Variance below which a target's weight stops growing.
const VARIANCE_FLOOR: f64 = 1e-12;

/// Fitted `offset`, `offset2` and `gamma`, one entry per gene.
#[derive(Debug, Clone, PartialEq)]
pub struct KineticParams {
    pub offset: Array1<f32>,
    pub offset2: Array1<f32>,
    pub gamma: Array1<f32>,
}

impl KineticParams {
    pub fn zeros(n_vars: usize) -> Self {
        KineticParams {
            offset: Array1::zeros(n_vars),
            offset2: Array1::zeros(n_vars),
            gamma: Array1::zeros(n_vars),
        }
    }

    pub fn len(&self) -> usize {
        self.gamma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gamma.is_empty()
    }

    /// Largest change relative to `self` over all parameters and genes.
    fn max_relative_change(&self, other: &KineticParams) -> f64 {
        [
            (&self.offset, &other.offset),
            (&self.offset2, &other.offset2),
            (&self.gamma, &other.gamma),
        ]
        .iter()
        .flat_map(|(a, b)| a.iter().zip(b.iter()))
        .map(|(&a, &b)| (a as f64 - b as f64).abs() / (1.0 + (a as f64).abs()))
        .fold(0.0, f64::max)
    }
}

/// Least-squares slope per column: `gamma = cov(x, y) / var(x)`.
///
/// With `fit_offset` the moments are centred and `offset = mean(y) − gamma·mean(x)`. Without it
/// the line passes through the origin (moments about zero) and the offset is zero.
///
/// A column with zero variance in `x` gets `gamma = 0`, and therefore `offset = mean(y)` when
/// an offset is fitted.
///
/// # Arguments
///
/// * `x` - Regressor, cells × genes
/// * `y` - Target, same shape as `x`
/// * `fit_offset` - Whether to fit an intercept
///
/// # Returns
///
/// `(offset, gamma)`, one entry per column.
pub fn solve_cov(x: ArrayView2<f32>, y: ArrayView2<f32>, fit_offset: bool) -> (Array1<f32>, Array1<f32>) {
    let n_vars = x.ncols();
    let n_obs = x.nrows();
    let mut offset = Array1::zeros(n_vars);
    let mut gamma = Array1::zeros(n_vars);
    if n_obs == 0 {
        return (offset, gamma);
    }
    let n = n_obs as f64;

    for (j, (xj, yj)) in x.axis_iter(Axis(1)).zip(y.axis_iter(Axis(1))).enumerate() {
        let (mean_x, mean_y) = if fit_offset {
            (
                xj.iter().map(|&v| v as f64).sum::<f64>() / n,
                yj.iter().map(|&v| v as f64).sum::<f64>() / n,
            )
        } else {
            (0.0, 0.0)
        };

        let mut cov_xy = 0.0;
        let mut var_x = 0.0;
        let mut raw_xx = 0.0;
        for (&xv, &yv) in xj.iter().zip(yj.iter()) {
            let dx = xv as f64 - mean_x;
            cov_xy += dx * (yv as f64 - mean_y);
            var_x += dx * dx;
            raw_xx += (xv as f64) * (xv as f64);
        }

        // constant columns leave only rounding noise in the centred variance
        let slope = if var_x > f64::EPSILON * raw_xx && var_x > 0.0 {
            cov_xy / var_x
        } else {
            0.0
        };
        let slope = if slope.is_finite() { slope } else { 0.0 };

        gamma[j] = slope as f32;
        if fit_offset {
            offset[j] = (mean_y - slope * mean_x) as f32;
        }
    }

    (offset, gamma)
}

/// Generalised least squares over two stacked regressions sharing one slope:
///
/// - `y  = offset  + gamma·x`, weighted by `1 / res_std²`
/// - `y2 = offset2 + gamma·x2`, weighted by `1 / res2_std²`
///
/// The second-order statistics carry different noise than the first-order ones, so each target is
/// weighted by its own inverse variance (floored to keep the weights finite). Offsets are only
/// estimated when their flag is set, otherwise they are zero. A gene whose normal equations are
/// singular gets all-zero parameters.
///
/// # Arguments
///
/// * `x`, `y` - First-order regressor and target, cells × genes
/// * `x2`, `y2` - Second-order regressor and target, same shape
/// * `res_std`, `res2_std` - Residual standard deviation of each target, one per gene
/// * `fit_offset`, `fit_offset2` - Which offsets to estimate
#[allow(clippy::too_many_arguments)]
pub fn solve2_inv(
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
    x2: ArrayView2<f32>,
    y2: ArrayView2<f32>,
    res_std: ArrayView1<f32>,
    res2_std: ArrayView1<f32>,
    fit_offset: bool,
    fit_offset2: bool,
) -> KineticParams {
    let n_vars = x.ncols();
    let mut params = KineticParams::zeros(n_vars);

    // unknowns: 0 = offset, 1 = offset2, 2 = gamma
    let active: Vec<usize> = [(0, fit_offset), (1, fit_offset2), (2, true)]
        .iter()
        .filter_map(|&(k, on)| if on { Some(k) } else { None })
        .collect();

    let mut singular = 0usize;
    for j in 0..n_vars {
        let w1 = inverse_variance(res_std[j]);
        let w2 = inverse_variance(res2_std[j]);
        let s1 = ColumnSums::new(x.column(j), y.column(j));
        let s2 = ColumnSums::new(x2.column(j), y2.column(j));

        let normal = [
            [w1 * s1.n, 0.0, w1 * s1.x],
            [0.0, w2 * s2.n, w2 * s2.x],
            [w1 * s1.x, w2 * s2.x, w1 * s1.xx + w2 * s2.xx],
        ];
        let rhs = [w1 * s1.y, w2 * s2.y, w1 * s1.xy + w2 * s2.xy];

        let k = active.len();
        let a = DMatrix::from_fn(k, k, |r, c| normal[active[r]][active[c]]);
        let b = DVector::from_fn(k, |r, _| rhs[active[r]]);

        let solution = match a.lu().solve(&b) {
            Some(sol) if sol.iter().all(|v| v.is_finite()) => sol,
            _ => {
                singular += 1;
                continue;
            }
        };

        for (r, &unknown) in active.iter().enumerate() {
            let value = solution[r] as f32;
            match unknown {
                0 => params.offset[j] = value,
                1 => params.offset2[j] = value,
                _ => params.gamma[j] = value,
            }
        }
    }

    if singular > 0 {
        log::debug!(
            "{} of {} genes had singular normal equations; parameters set to zero",
            singular,
            n_vars
        );
    }
    params
}

/// Maximum-likelihood solution of the stochastic model.
///
/// The residual variances of both regressions depend on the parameters being estimated, so the
/// fit alternates between estimating the residual standard deviations from the current
/// parameters and re-solving the weighted system with [`solve2_inv`], starting from unit weights.
/// Iteration stops once the largest relative parameter change drops below `options.tol`. When
/// `options.max_iter` is reached first, a warning is logged and the latest estimate is returned.
///
/// # Arguments
///
/// * `ms`, `mu` - First-order moments, cells × genes
/// * `mus`, `mss` - Second-order moments (unspliced·spliced, spliced·spliced)
/// * `fit_offset`, `fit_offset2` - Which offsets to estimate
/// * `options` - Iteration budget and tolerance
pub fn solve2_mle(
    ms: ArrayView2<f32>,
    mu: ArrayView2<f32>,
    mus: ArrayView2<f32>,
    mss: ArrayView2<f32>,
    fit_offset: bool,
    fit_offset2: bool,
    options: &MleOptions,
) -> KineticParams {
    let x2 = &mss * 2.0 - &ms;
    let y2 = &mus * 2.0 + &mu;

    let unit = Array1::ones(ms.ncols());
    let mut params = solve2_inv(
        ms,
        mu,
        x2.view(),
        y2.view(),
        unit.view(),
        unit.view(),
        fit_offset,
        fit_offset2,
    );

    let mut change = f64::INFINITY;
    for iteration in 1..=options.max_iter {
        let res_std = column_stds(linear_residual(ms, mu, &params.gamma, &params.offset).view());
        let res2_std =
            column_stds(linear_residual(x2.view(), y2.view(), &params.gamma, &params.offset2).view());

        let next = solve2_inv(
            ms,
            mu,
            x2.view(),
            y2.view(),
            res_std.view(),
            res2_std.view(),
            fit_offset,
            fit_offset2,
        );
        change = params.max_relative_change(&next);
        params = next;

        if change < options.tol {
            log::debug!("maximum-likelihood fit converged after {} iterations", iteration);
            return params;
        }
    }

    log::warn!(
        "maximum-likelihood fit did not converge within {} iterations (last relative change {:.3e}), using latest estimate",
        options.max_iter,
        change
    );
    params
}

/// `y − gamma·x − offset`
fn linear_residual(
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
    gamma: &Array1<f32>,
    offset: &Array1<f32>,
) -> Array2<f32> {
    &y - &(&x * gamma) - offset
}

#[inline]
fn inverse_variance(std: f32) -> f64 {
    let std = std as f64;
    let var = if std.is_finite() { std * std } else { 0.0 };
    1.0 / var.max(VARIANCE_FLOOR)
}

struct ColumnSums {
    n: f64,
    x: f64,
    y: f64,
    xx: f64,
    xy: f64,
}

impl ColumnSums {
    fn new(x: ArrayView1<f32>, y: ArrayView1<f32>) -> Self {
        let mut sums = ColumnSums {
            n: x.len() as f64,
            x: 0.0,
            y: 0.0,
            xx: 0.0,
            xy: 0.0,
        };
        for (&xv, &yv) in x.iter().zip(y.iter()) {
            let (xv, yv) = (xv as f64, yv as f64);
            sums.x += xv;
            sums.y += yv;
            sums.xx += xv * xv;
            sums.xy += xv * yv;
        }
        sums
    }
}
