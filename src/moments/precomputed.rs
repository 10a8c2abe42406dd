use ndarray::Array2;

use crate::data::Dataset;
use crate::error::VelocityError;
use crate::moments::{MomentsProvider, MSS_KEY, MS_KEY, MUS_KEY, MU_KEY};

/// Moments that were computed elsewhere and stored as dataset layers.
///
/// `ensure_moments` cannot create anything; it only checks that `Ms` and `Mu` exist.
/// Second-order moments are read from `Mss` and `Mus`, which follow every cell/gene subset of the
/// dataset like any other layer.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedMoments;

impl MomentsProvider for PrecomputedMoments {
    fn ensure_moments(&self, data: &mut Dataset) -> anyhow::Result<()> {
        for key in [MS_KEY, MU_KEY] {
            if !data.has_layer(key) {
                return Err(VelocityError::MissingLayer(key.to_string()).into());
            }
        }
        Ok(())
    }

    fn second_order_moments(&self, data: &Dataset) -> anyhow::Result<(Array2<f32>, Array2<f32>)> {
        Ok((data.dense_layer(MSS_KEY)?, data.dense_layer(MUS_KEY)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Layer;
    use ndarray::array;

    #[test]
    fn test_reads_layers_of_the_view() {
        let data = Dataset::new(2, vec!["g0".into(), "g1".into()])
            .with_layer(MSS_KEY, Layer::Dense(array![[1.0, 2.0], [3.0, 4.0]]))
            .unwrap()
            .with_layer(MUS_KEY, Layer::Dense(array![[5.0, 6.0], [7.0, 8.0]]))
            .unwrap();
        let view = data.subset_vars(&[false, true]).unwrap();

        let (mss, mus) = PrecomputedMoments.second_order_moments(&view).unwrap();
        assert_eq!(mss, array![[2.0_f32], [4.0]]);
        assert_eq!(mus, array![[6.0_f32], [8.0]]);
    }

    #[test]
    fn test_missing_first_order_layers() {
        let mut data = Dataset::new(2, vec!["g0".into()]);
        let err = PrecomputedMoments.ensure_moments(&mut data).unwrap_err();
        assert_eq!(
            err.downcast_ref::<VelocityError>(),
            Some(&VelocityError::MissingLayer(MS_KEY.to_string()))
        );
    }
}
