use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Minimum `r2` of a velocity gene
pub const MIN_R2: f32 = 0.01;
/// Minimum `gamma` of a velocity gene
pub const MIN_GAMMA: f32 = 0.01;

/// Coefficient of determination per column: `1 − Σresidual² / Σtotal²`.
///
/// `total` is expected to be centred already. Columns whose total sum of squares is zero get 0.
/// Values below zero are returned as they are.
pub fn r_squared(residual: ArrayView2<f32>, total: ArrayView2<f32>) -> Array1<f32> {
    residual
        .axis_iter(Axis(1))
        .zip(total.axis_iter(Axis(1)))
        .map(|(res, tot)| {
            let ss_res = sum_of_squares(res);
            let ss_tot = sum_of_squares(tot);
            if ss_tot > 0.0 {
                (1.0 - ss_res / ss_tot) as f32
            } else {
                0.0
            }
        })
        .collect()
}

/// Genes with `r2 > 0.01` and `gamma > 0.01`.
pub fn velocity_gene_mask(r2: ArrayView1<f32>, gamma: ArrayView1<f32>) -> Vec<bool> {
    r2.iter()
        .zip(gamma.iter())
        .map(|(&r, &g)| r > MIN_R2 && g > MIN_GAMMA)
        .collect()
}

/// `Mu − gamma·Ms`, minus `offset` when given.
pub fn first_order_residual(
    ms: ArrayView2<f32>,
    mu: ArrayView2<f32>,
    gamma: &Array1<f32>,
    offset: Option<&Array1<f32>>,
) -> Array2<f32> {
    let mut residual = &mu - &(&ms * gamma);
    if let Some(offset) = offset {
        residual -= offset;
    }
    residual
}

pub(crate) fn column_means(matrix: ArrayView2<f32>) -> Array1<f32> {
    matrix
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(matrix.ncols()))
}

/// Population standard deviation of every column.
pub(crate) fn column_stds(matrix: ArrayView2<f32>) -> Array1<f32> {
    if matrix.nrows() == 0 {
        return Array1::zeros(matrix.ncols());
    }
    matrix.std_axis(Axis(0), 0.0)
}

#[inline]
fn sum_of_squares(values: ArrayView1<f32>) -> f64 {
    values.iter().map(|&v| (v as f64) * (v as f64)).sum()
}
