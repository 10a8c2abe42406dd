//! # single-velocity
//!
//! A Rust library for RNA velocity estimation on single-cell data, part of the single-rust ecosystem.
//!
//! RNA velocity relates the abundance of unspliced (nascent) and spliced (mature) transcripts of a
//! gene to infer whether it is being induced or repressed in each cell. This crate fits the
//! steady-state kinetics of every gene from neighbourhood-smoothed moments and reports the
//! per-cell residuals as velocities.
//!
//! ## Core Features
//!
//! - **Deterministic model**: regression of unspliced on spliced first-order moments
//! - **Stochastic model**: joint fit with second-order moments, inverse-variance weighted
//! - **Maximum-likelihood refinement**: iterative fit accounting for parameter-dependent noise
//! - **Gene selection**: velocity genes chosen by fit quality (`r2`) and slope (`gamma`)
//! - **Sparse input**: layers may be dense `ndarray` matrices or `CsrMatrix` from nalgebra-sparse
//!
//! ## Quick Start
//!
//! Build a [`data::Dataset`] with `spliced`/`unspliced` layers and a `connectivities` graph, then
//! call [`velocity::velocity`] with a [`moments::ConnectivityMoments`] provider and a
//! [`velocity::VelocityConfig`]. The velocities end up in the `velocity` layer, the fitted
//! parameters in the gene annotations.
//!
//! ## Module Organization
//!
//! - **[`velocity`]**: Estimator, regression solvers and the driver
//! - **[`moments`]**: Sources of first- and second-order moments
//! - **[`data`]**: Annotated dataset container and housekeeping utilities
//! - **[`error`]**: Error types

pub mod data;
pub mod error;
pub mod moments;
pub mod velocity;
