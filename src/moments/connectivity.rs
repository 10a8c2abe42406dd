use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;

use crate::data::{Dataset, Layer};
use crate::error::VelocityError;
use crate::moments::{MomentsProvider, MS_KEY, MU_KEY, SPLICED_KEY, UNSPLICED_KEY};

pub const DEFAULT_GRAPH_KEY: &str = "connectivities";

/// Moments averaged over each cell's neighbourhood in a precomputed cell graph.
///
/// Every nonzero edge of the graph counts as a neighbour, each cell is its own neighbour, and
/// neighbours are weighted uniformly:
///
/// - `Ms = C·S`, `Mu = C·U`
/// - `Mss = C·(S∘S)`, `Mus = C·(S∘U)`
///
/// where `S`/`U` are the raw `spliced`/`unspliced` layers and `C` the row-normalised graph.
#[derive(Debug, Clone)]
pub struct ConnectivityMoments {
    graph_key: String,
}

impl Default for ConnectivityMoments {
    fn default() -> Self {
        ConnectivityMoments {
            graph_key: DEFAULT_GRAPH_KEY.to_string(),
        }
    }
}

impl ConnectivityMoments {
    pub fn new(graph_key: &str) -> Self {
        ConnectivityMoments {
            graph_key: graph_key.to_string(),
        }
    }

    pub fn graph_key(&self) -> &str {
        &self.graph_key
    }

    fn weights(&self, data: &Dataset) -> anyhow::Result<CsrMatrix<f32>> {
        data.obsp(&self.graph_key)
            .map(neighbourhood_weights)
            .ok_or_else(|| VelocityError::MissingGraph(self.graph_key.clone()).into())
    }
}

impl MomentsProvider for ConnectivityMoments {
    fn ensure_moments(&self, data: &mut Dataset) -> anyhow::Result<()> {
        log::info!("computing moments based on '{}'", self.graph_key);
        let weights = self.weights(data)?;
        let spliced = data.dense_layer(SPLICED_KEY)?;
        let unspliced = data.dense_layer(UNSPLICED_KEY)?;

        let ms = smooth(&weights, &spliced);
        let mu = smooth(&weights, &unspliced);
        data.insert_layer(MS_KEY, Layer::Dense(ms))?;
        data.insert_layer(MU_KEY, Layer::Dense(mu))?;
        log::debug!("added '{}' and '{}' (layers)", MS_KEY, MU_KEY);
        Ok(())
    }

    fn second_order_moments(&self, data: &Dataset) -> anyhow::Result<(Array2<f32>, Array2<f32>)> {
        let weights = self.weights(data)?;
        let spliced = data.dense_layer(SPLICED_KEY)?;
        let unspliced = data.dense_layer(UNSPLICED_KEY)?;

        let mss = smooth(&weights, &(&spliced * &spliced));
        let mus = smooth(&weights, &(&spliced * &unspliced));
        Ok((mss, mus))
    }
}

/// Binarise the graph, add self-loops and normalise every row to sum to one.
fn neighbourhood_weights(graph: &CsrMatrix<f32>) -> CsrMatrix<f32> {
    let mut coo = CooMatrix::new(graph.nrows(), graph.ncols());
    for (i, row) in graph.row_iter().enumerate() {
        let mut neighbours: Vec<usize> = row
            .col_indices()
            .iter()
            .zip(row.values())
            .filter_map(|(&j, &v)| if v > 0.0 { Some(j) } else { None })
            .collect();
        if !neighbours.contains(&i) {
            neighbours.push(i);
        }

        let weight = 1.0 / neighbours.len() as f32;
        for j in neighbours {
            coo.push(i, j, weight);
        }
    }
    CsrMatrix::from(&coo)
}

fn smooth(weights: &CsrMatrix<f32>, values: &Array2<f32>) -> Array2<f32> {
    let mut out = Array2::zeros((weights.nrows(), values.ncols()));
    for (i, row) in weights.row_iter().enumerate() {
        let mut target = out.row_mut(i);
        for (&j, &w) in row.col_indices().iter().zip(row.values()) {
            target.scaled_add(w, &values.row(j));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn create_chain_dataset() -> Dataset {
        // 0 - 1 - 2
        let coo = CooMatrix::try_from_triplets(
            3,
            3,
            vec![0, 1, 1, 2],
            vec![1, 0, 2, 1],
            vec![0.5, 0.5, 0.8, 0.8],
        )
        .unwrap();
        Dataset::new(3, vec!["g0".into(), "g1".into()])
            .with_layer(SPLICED_KEY, Layer::Dense(array![[1.0, 0.0], [2.0, 3.0], [3.0, 6.0]]))
            .unwrap()
            .with_layer(UNSPLICED_KEY, Layer::Dense(array![[0.0, 1.0], [1.0, 1.0], [2.0, 1.0]]))
            .unwrap()
            .with_obsp(DEFAULT_GRAPH_KEY, CsrMatrix::from(&coo))
            .unwrap()
    }

    #[test]
    fn test_first_order_moments() {
        let mut data = create_chain_dataset();
        ConnectivityMoments::default().ensure_moments(&mut data).unwrap();

        let ms = data.dense_layer(MS_KEY).unwrap();
        // cell 0 averages cells {0, 1}, cell 1 averages {0, 1, 2}
        assert_abs_diff_eq!(ms[[0, 0]], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(ms[[1, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ms[[1, 1]], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ms[[2, 1]], 4.5, epsilon = 1e-6);

        let mu = data.dense_layer(MU_KEY).unwrap();
        assert_abs_diff_eq!(mu[[2, 0]], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_second_order_moments() {
        let data = create_chain_dataset();
        let (mss, mus) = ConnectivityMoments::default()
            .second_order_moments(&data)
            .unwrap();

        // cell 0: mean of 1² and 2²
        assert_abs_diff_eq!(mss[[0, 0]], 2.5, epsilon = 1e-6);
        // cell 2: mean of 2·1 and 3·2
        assert_abs_diff_eq!(mus[[2, 0]], 4.0, epsilon = 1e-6);
        assert_eq!(mss.dim(), (3, 2));
    }

    #[test]
    fn test_missing_graph() {
        let mut data = create_chain_dataset();
        let provider = ConnectivityMoments::new("distances");
        assert_eq!(provider.graph_key(), "distances");
        assert_eq!(ConnectivityMoments::default().graph_key(), DEFAULT_GRAPH_KEY);

        let err = provider.ensure_moments(&mut data).unwrap_err();
        assert_eq!(
            err.downcast_ref::<VelocityError>(),
            Some(&VelocityError::MissingGraph("distances".to_string()))
        );
    }
}
