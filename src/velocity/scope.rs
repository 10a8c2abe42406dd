use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::data::mask_indices;

/// Cells and genes that take part in one fitting stage.
///
/// A scope is an immutable value: narrowing to a new gene set produces a new scope. Whether the
/// genes form a proper subset of all genes is decided once, when the scope is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitScope {
    cells: Option<Vec<usize>>,
    genes: Vec<usize>,
    n_vars: usize,
    is_proper_subset: bool,
}

impl FitScope {
    /// All `n_vars` genes, optionally restricted to the given cell rows.
    pub fn full(n_vars: usize, cells: Option<Vec<usize>>) -> Self {
        FitScope {
            cells,
            genes: (0..n_vars).collect(),
            n_vars,
            is_proper_subset: false,
        }
    }

    /// Same cells, genes where `mask` is true.
    ///
    /// A mask that is uniformly true or uniformly false does not narrow anything: the new scope
    /// covers all genes.
    pub fn with_genes(&self, mask: &[bool]) -> Self {
        debug_assert_eq!(mask.len(), self.n_vars);
        if is_proper_subset(mask) {
            FitScope {
                cells: self.cells.clone(),
                genes: mask_indices(mask),
                n_vars: self.n_vars,
                is_proper_subset: true,
            }
        } else {
            FitScope::full(self.n_vars, self.cells.clone())
        }
    }

    pub fn cells(&self) -> Option<&[usize]> {
        self.cells.as_deref()
    }

    pub fn genes(&self) -> &[usize] {
        &self.genes
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn is_proper_subset(&self) -> bool {
        self.is_proper_subset
    }

    /// Scope columns of a full-width matrix.
    pub fn gather_genes(&self, matrix: ArrayView2<f32>) -> Array2<f32> {
        if self.is_proper_subset {
            matrix.select(Axis(1), &self.genes)
        } else {
            matrix.to_owned()
        }
    }

    /// Scope rows of a matrix over all cells.
    pub fn gather_cells(&self, matrix: ArrayView2<f32>) -> Array2<f32> {
        match &self.cells {
            Some(rows) => matrix.select(Axis(0), rows),
            None => matrix.to_owned(),
        }
    }

    /// Write scope-width `values` into the scope positions of a full-width vector.
    pub fn scatter(&self, target: &mut Array1<f32>, values: ArrayView1<f32>) {
        for (&j, &v) in self.genes.iter().zip(values.iter()) {
            target[j] = v;
        }
    }

    /// Full-width matrix holding `values` in the scope columns and zeros elsewhere.
    pub fn scatter_columns(&self, values: Array2<f32>) -> Array2<f32> {
        if !self.is_proper_subset {
            return values;
        }
        let mut full = Array2::zeros((values.nrows(), self.n_vars));
        for (src, &dst) in self.genes.iter().enumerate() {
            full.column_mut(dst).assign(&values.column(src));
        }
        full
    }
}

/// True when `mask` holds both `true` and `false` entries.
pub fn is_proper_subset(mask: &[bool]) -> bool {
    mask.contains(&true) && mask.contains(&false)
}
