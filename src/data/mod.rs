//! Annotated cells × genes container consumed by the velocity driver.
//!
//! A [`Dataset`] holds named expression layers (dense `ndarray` or sparse `CsrMatrix`), string
//! annotations per cell (`obs`), typed annotations per gene (`var`) and sparse cell × cell graphs
//! (`obsp`). Subsetting is always by value: a cell or gene subset is a new, independent dataset.

use std::collections::HashMap;

use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{Array2, ArrayView2, Axis};
use single_utilities::traits::FloatOps;

use crate::error::VelocityError;

pub mod utils;

/// A single cells × genes matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Dense(Array2<f32>),
    Sparse(CsrMatrix<f32>),
}

impl Layer {
    /// Build a dense layer from any float matrix, converting to single precision.
    pub fn from_dense<T>(matrix: ArrayView2<T>) -> Self
    where
        T: FloatOps,
    {
        Layer::Dense(matrix.mapv(|v| sanitize(v.to_f32().unwrap_or(0.0))))
    }

    /// Build a sparse layer from any float CSR matrix, converting to single precision.
    pub fn from_sparse<T>(matrix: &CsrMatrix<T>) -> Self
    where
        T: FloatOps,
    {
        let mut coo = CooMatrix::new(matrix.nrows(), matrix.ncols());
        for (i, j, &v) in matrix.triplet_iter() {
            coo.push(i, j, v.to_f32().unwrap_or(0.0));
        }
        Layer::Sparse(CsrMatrix::from(&coo))
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            Layer::Dense(m) => m.dim(),
            Layer::Sparse(m) => (m.nrows(), m.ncols()),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Layer::Sparse(_))
    }

    /// Dense copy of the layer. Non-finite entries become zero.
    pub fn to_dense(&self) -> Array2<f32> {
        match self {
            Layer::Dense(m) => m.mapv(sanitize),
            Layer::Sparse(m) => csr_to_dense(m),
        }
    }

    pub fn into_dense(self) -> Array2<f32> {
        match self {
            Layer::Dense(mut m) => {
                m.mapv_inplace(sanitize);
                m
            }
            Layer::Sparse(m) => csr_to_dense(&m),
        }
    }

    /// Sum of every row, i.e. total molecules per cell.
    pub fn row_sums(&self) -> Vec<f32> {
        match self {
            Layer::Dense(m) => m.sum_axis(Axis(1)).to_vec(),
            Layer::Sparse(m) => m.row_iter().map(|row| row.values().iter().sum()).collect(),
        }
    }

    fn select_rows(&self, rows: &[usize]) -> Layer {
        match self {
            Layer::Dense(m) => Layer::Dense(m.select(Axis(0), rows)),
            Layer::Sparse(m) => Layer::Sparse(select_csr_rows(m, rows)),
        }
    }

    fn select_cols(&self, cols: &[usize]) -> Layer {
        match self {
            Layer::Dense(m) => Layer::Dense(m.select(Axis(1), cols)),
            Layer::Sparse(m) => Layer::Sparse(select_csr_cols(m, cols)),
        }
    }
}

/// A per-gene annotation column.
#[derive(Debug, Clone, PartialEq)]
pub enum VarColumn {
    Float(Vec<f32>),
    Bool(Vec<bool>),
}

impl VarColumn {
    pub fn len(&self) -> usize {
        match self {
            VarColumn::Float(v) => v.len(),
            VarColumn::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the column holds fewer than two distinct values.
    pub fn is_constant(&self) -> bool {
        match self {
            VarColumn::Float(v) => v.first().is_none_or(|first| v.iter().all(|x| x == first)),
            VarColumn::Bool(v) => v.first().is_none_or(|first| v.iter().all(|x| x == first)),
        }
    }

    pub fn as_float(&self) -> Option<&[f32]> {
        match self {
            VarColumn::Float(v) => Some(v),
            VarColumn::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            VarColumn::Bool(v) => Some(v),
            VarColumn::Float(_) => None,
        }
    }

    fn select(&self, idx: &[usize]) -> VarColumn {
        match self {
            VarColumn::Float(v) => VarColumn::Float(idx.iter().map(|&i| v[i]).collect()),
            VarColumn::Bool(v) => VarColumn::Bool(idx.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// Annotated expression data: `n_obs` cells × `n_vars` genes.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    n_obs: usize,
    var_names: Vec<String>,
    layers: HashMap<String, Layer>,
    obs: HashMap<String, Vec<String>>,
    var: HashMap<String, VarColumn>,
    obsp: HashMap<String, CsrMatrix<f32>>,
}

impl Dataset {
    /// Create an empty dataset with `n_obs` cells and the given gene names.
    pub fn new(n_obs: usize, var_names: Vec<String>) -> Self {
        Dataset {
            n_obs,
            var_names,
            layers: HashMap::new(),
            obs: HashMap::new(),
            var: HashMap::new(),
            obsp: HashMap::new(),
        }
    }

    /// Add a layer, consuming and returning the dataset
    pub fn with_layer(mut self, key: &str, layer: Layer) -> anyhow::Result<Self> {
        self.insert_layer(key, layer)?;
        Ok(self)
    }

    /// Add a cell annotation, consuming and returning the dataset
    pub fn with_obs(mut self, key: &str, values: Vec<String>) -> anyhow::Result<Self> {
        self.insert_obs(key, values)?;
        Ok(self)
    }

    /// Add a cell graph, consuming and returning the dataset
    pub fn with_obsp(mut self, key: &str, graph: CsrMatrix<f32>) -> anyhow::Result<Self> {
        self.insert_obsp(key, graph)?;
        Ok(self)
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_vars(&self) -> usize {
        self.var_names.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_obs, self.n_vars())
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    // ---- layers ----

    pub fn insert_layer(&mut self, key: &str, layer: Layer) -> anyhow::Result<()> {
        ensure_shape(key, self.shape(), layer.shape())?;
        self.layers.insert(key.to_string(), layer);
        Ok(())
    }

    pub fn layer(&self, key: &str) -> Option<&Layer> {
        self.layers.get(key)
    }

    pub fn has_layer(&self, key: &str) -> bool {
        self.layers.contains_key(key)
    }

    pub fn remove_layer(&mut self, key: &str) -> Option<Layer> {
        self.layers.remove(key)
    }

    pub fn layer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.layers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Dense copy of a layer, or `MissingLayer` if it does not exist.
    pub fn dense_layer(&self, key: &str) -> anyhow::Result<Array2<f32>> {
        self.layers
            .get(key)
            .map(Layer::to_dense)
            .ok_or_else(|| VelocityError::MissingLayer(key.to_string()).into())
    }

    /// Write `values` into the rows `rows` of layer `key`.
    ///
    /// A missing layer is created as a zero matrix of full dataset shape and a sparse layer is
    /// densified first, so rows not listed keep their previous values.
    pub fn write_layer_rows(
        &mut self,
        key: &str,
        rows: &[usize],
        values: ArrayView2<f32>,
    ) -> anyhow::Result<()> {
        ensure_shape(key, (rows.len(), self.n_vars()), values.dim())?;
        if let Some(&row) = rows.iter().find(|&&r| r >= self.n_obs) {
            return Err(anyhow::anyhow!(
                "Row index {} out of bounds for {} cells",
                row,
                self.n_obs
            ));
        }

        let mut dense = match self.layers.remove(key) {
            Some(layer) => layer.into_dense(),
            None => Array2::zeros(self.shape()),
        };
        for (src, &dst) in rows.iter().enumerate() {
            dense.row_mut(dst).assign(&values.row(src));
        }
        self.layers.insert(key.to_string(), Layer::Dense(dense));
        Ok(())
    }

    // ---- cell annotations ----

    pub fn insert_obs(&mut self, key: &str, values: Vec<String>) -> anyhow::Result<()> {
        ensure_shape(key, (self.n_obs, 1), (values.len(), 1))?;
        self.obs.insert(key.to_string(), values);
        Ok(())
    }

    pub fn obs(&self, key: &str) -> Option<&[String]> {
        self.obs.get(key).map(Vec::as_slice)
    }

    pub fn has_obs(&self, key: &str) -> bool {
        self.obs.contains_key(key)
    }

    pub fn remove_obs(&mut self, key: &str) -> Option<Vec<String>> {
        self.obs.remove(key)
    }

    pub fn obs_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.obs.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ---- gene annotations ----

    pub fn insert_var(&mut self, key: &str, column: VarColumn) -> anyhow::Result<()> {
        ensure_shape(key, (self.n_vars(), 1), (column.len(), 1))?;
        self.var.insert(key.to_string(), column);
        Ok(())
    }

    pub fn var(&self, key: &str) -> Option<&VarColumn> {
        self.var.get(key)
    }

    pub fn remove_var(&mut self, key: &str) -> Option<VarColumn> {
        self.var.remove(key)
    }

    pub fn var_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.var.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ---- cell graphs ----

    pub fn insert_obsp(&mut self, key: &str, graph: CsrMatrix<f32>) -> anyhow::Result<()> {
        ensure_shape(key, (self.n_obs, self.n_obs), (graph.nrows(), graph.ncols()))?;
        self.obsp.insert(key.to_string(), graph);
        Ok(())
    }

    pub fn obsp(&self, key: &str) -> Option<&CsrMatrix<f32>> {
        self.obsp.get(key)
    }

    pub fn remove_obsp(&mut self, key: &str) -> Option<CsrMatrix<f32>> {
        self.obsp.remove(key)
    }

    pub fn obsp_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.obsp.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ---- subsetting ----

    /// Independent dataset restricted to the cells where `mask` is true.
    pub fn subset_obs(&self, mask: &[bool]) -> anyhow::Result<Dataset> {
        ensure_mask(mask, self.n_obs, "cells")?;
        Ok(self.select_obs(&mask_indices(mask)))
    }

    /// Independent dataset restricted to the genes where `mask` is true.
    pub fn subset_vars(&self, mask: &[bool]) -> anyhow::Result<Dataset> {
        ensure_mask(mask, self.n_vars(), "genes")?;
        Ok(self.select_vars(&mask_indices(mask)))
    }

    /// Permanently drop the genes where `mask` is false.
    pub fn subset_vars_inplace(&mut self, mask: &[bool]) -> anyhow::Result<()> {
        *self = self.subset_vars(mask)?;
        Ok(())
    }

    pub(crate) fn select_obs(&self, rows: &[usize]) -> Dataset {
        Dataset {
            n_obs: rows.len(),
            var_names: self.var_names.clone(),
            layers: self
                .layers
                .iter()
                .map(|(k, layer)| (k.clone(), layer.select_rows(rows)))
                .collect(),
            obs: self
                .obs
                .iter()
                .map(|(k, values)| (k.clone(), rows.iter().map(|&i| values[i].clone()).collect()))
                .collect(),
            var: self.var.clone(),
            obsp: self
                .obsp
                .iter()
                .map(|(k, graph)| (k.clone(), select_csr_cols(&select_csr_rows(graph, rows), rows)))
                .collect(),
        }
    }

    pub(crate) fn select_vars(&self, cols: &[usize]) -> Dataset {
        Dataset {
            n_obs: self.n_obs,
            var_names: cols.iter().map(|&j| self.var_names[j].clone()).collect(),
            layers: self
                .layers
                .iter()
                .map(|(k, layer)| (k.clone(), layer.select_cols(cols)))
                .collect(),
            obs: self.obs.clone(),
            var: self
                .var
                .iter()
                .map(|(k, column)| (k.clone(), column.select(cols)))
                .collect(),
            obsp: self.obsp.clone(),
        }
    }
}

/// Positions of the true entries of a mask.
pub fn mask_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &keep)| if keep { Some(i) } else { None })
        .collect()
}

fn ensure_shape(name: &str, expected: (usize, usize), found: (usize, usize)) -> anyhow::Result<()> {
    if expected != found {
        return Err(VelocityError::ShapeMismatch {
            name: name.to_string(),
            expected,
            found,
        }
        .into());
    }
    Ok(())
}

fn ensure_mask(mask: &[bool], expected: usize, axis: &str) -> anyhow::Result<()> {
    if mask.len() != expected {
        return Err(VelocityError::configuration(format!(
            "mask over {} has length {}, expected {}",
            axis,
            mask.len(),
            expected
        ))
        .into());
    }
    Ok(())
}

#[inline]
fn sanitize(v: f32) -> f32 {
    if v.is_finite() { v } else { 0.0 }
}

pub(crate) fn csr_to_dense(matrix: &CsrMatrix<f32>) -> Array2<f32> {
    let mut out = Array2::zeros((matrix.nrows(), matrix.ncols()));
    for (i, j, &v) in matrix.triplet_iter() {
        out[[i, j]] += sanitize(v);
    }
    out
}

fn select_csr_rows(matrix: &CsrMatrix<f32>, rows: &[usize]) -> CsrMatrix<f32> {
    let mut coo = CooMatrix::new(rows.len(), matrix.ncols());
    for (new_row, &old_row) in rows.iter().enumerate() {
        let row = matrix.row(old_row);
        for (&col, &v) in row.col_indices().iter().zip(row.values()) {
            coo.push(new_row, col, v);
        }
    }
    CsrMatrix::from(&coo)
}

fn select_csr_cols(matrix: &CsrMatrix<f32>, cols: &[usize]) -> CsrMatrix<f32> {
    let mut new_index = vec![None; matrix.ncols()];
    for (new_col, &old_col) in cols.iter().enumerate() {
        new_index[old_col] = Some(new_col);
    }

    let mut coo = CooMatrix::new(matrix.nrows(), cols.len());
    for (i, j, &v) in matrix.triplet_iter() {
        if let Some(new_col) = new_index[j] {
            coo.push(i, new_col, v);
        }
    }
    CsrMatrix::from(&coo)
}
