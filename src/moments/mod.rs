//! First- and second-order moments consumed by the velocity estimator.
//!
//! Moment smoothing depends on a neighbourhood graph whose construction lives outside this crate.
//! The estimator only talks to a [`MomentsProvider`], which either fills the first-order layers
//! (`Ms`, `Mu`) or returns second-order moments (`Mss`, `Mus`) for whatever cell/gene view it is
//! handed.
//!
//! Two providers ship with the crate:
//!
//! - [`PrecomputedMoments`]: moments already stored as dataset layers.
//! - [`ConnectivityMoments`]: moments averaged over a precomputed `connectivities` graph.

use ndarray::Array2;

use crate::data::Dataset;

mod connectivity;
mod precomputed;

pub use connectivity::ConnectivityMoments;
pub use precomputed::PrecomputedMoments;

pub const MS_KEY: &str = "Ms";
pub const MU_KEY: &str = "Mu";
pub const MSS_KEY: &str = "Mss";
pub const MUS_KEY: &str = "Mus";
pub const SPLICED_KEY: &str = "spliced";
pub const UNSPLICED_KEY: &str = "unspliced";

pub trait MomentsProvider {
    /// Populate the first-order `Ms`/`Mu` layers of `data`.
    fn ensure_moments(&self, data: &mut Dataset) -> anyhow::Result<()>;

    /// Second-order moments `(Mss, Mus)` for exactly the cells and genes of `data`.
    fn second_order_moments(&self, data: &Dataset) -> anyhow::Result<(Array2<f32>, Array2<f32>)>;
}
