use crate::data::Dataset;

/// Layers kept by [`cleanup`] when nothing else is requested.
pub const DEFAULT_KEEP: [&str; 2] = ["spliced", "unspliced"];

const ABUNDANCE_LAYERS: [&str; 3] = ["spliced", "unspliced", "ambiguous"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    Obs,
    Var,
    Obsp,
    Layers,
    All,
}

/// Mean per-cell fraction of spliced/unspliced/ambiguous molecules.
///
/// Only the layers present in `data` take part. Each fraction is rounded to two decimals.
/// Cells without any counts in these layers are skipped.
pub fn show_proportions(data: &Dataset) -> Vec<(String, f32)> {
    let present: Vec<&str> = ABUNDANCE_LAYERS
        .iter()
        .copied()
        .filter(|key| data.has_layer(key))
        .collect();

    let totals: Vec<Vec<f32>> = present
        .iter()
        .filter_map(|key| data.layer(key).map(|layer| layer.row_sums()))
        .collect();

    let mut fraction_sums = vec![0.0_f64; present.len()];
    let mut n_cells = 0usize;
    for cell in 0..data.n_obs() {
        let cell_total: f64 = totals.iter().map(|t| t[cell] as f64).sum();
        if cell_total <= 0.0 {
            continue;
        }
        n_cells += 1;
        for (acc, t) in fraction_sums.iter_mut().zip(&totals) {
            *acc += t[cell] as f64 / cell_total;
        }
    }

    let proportions: Vec<(String, f32)> = present
        .iter()
        .zip(fraction_sums)
        .map(|(key, sum)| {
            let mean = if n_cells > 0 { sum / n_cells as f64 } else { 0.0 };
            (key.to_string(), ((mean * 100.0).round() / 100.0) as f32)
        })
        .collect();

    log::info!(
        "Abundance of {:?}: {:?}",
        present,
        proportions.iter().map(|(_, p)| *p).collect::<Vec<_>>()
    );
    proportions
}

/// Delete annotations and layers that are not listed in `keep`.
///
/// Works in place; clone the dataset first to keep the original. Unstructured annotations are not
/// modelled, so `CleanTarget::Obsp` stands in for them and clears the cell graphs.
pub fn cleanup(data: &mut Dataset, targets: &[CleanTarget], keep: &[&str]) {
    let wants = |target: CleanTarget| targets.contains(&target) || targets.contains(&CleanTarget::All);
    let dropped = |key: &str| !keep.contains(&key);

    if wants(CleanTarget::Obs) {
        for key in data.obs_keys().iter().filter(|k| dropped(k.as_str())) {
            data.remove_obs(key);
        }
    }
    if wants(CleanTarget::Var) {
        for key in data.var_keys().iter().filter(|k| dropped(k.as_str())) {
            data.remove_var(key);
        }
    }
    if wants(CleanTarget::Obsp) {
        for key in data.obsp_keys().iter().filter(|k| dropped(k.as_str())) {
            data.remove_obsp(key);
        }
    }
    if wants(CleanTarget::Layers) {
        for key in data.layer_keys().iter().filter(|k| dropped(k.as_str())) {
            log::debug!("Removing layer '{}'", key);
            data.remove_layer(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Layer, VarColumn};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn create_dataset() -> Dataset {
        Dataset::new(2, vec!["g0".into(), "g1".into()])
            .with_layer("spliced", Layer::Dense(array![[3.0, 3.0], [1.0, 0.0]]))
            .unwrap()
            .with_layer("unspliced", Layer::Dense(array![[2.0, 0.0], [1.0, 2.0]]))
            .unwrap()
            .with_layer("Ms", Layer::Dense(array![[1.0, 1.0], [1.0, 1.0]]))
            .unwrap()
    }

    #[test]
    fn test_show_proportions() {
        let data = create_dataset();
        let proportions = show_proportions(&data);

        // cell 0: 6 spliced / 8 total, cell 1: 1 spliced / 4 total
        assert_eq!(proportions.len(), 2);
        assert_eq!(proportions[0].0, "spliced");
        assert_abs_diff_eq!(proportions[0].1, 0.5, epsilon = 1e-6);
        assert_eq!(proportions[1].0, "unspliced");
        assert_abs_diff_eq!(proportions[1].1, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_show_proportions_skips_empty_cells() {
        let data = Dataset::new(2, vec!["g0".into()])
            .with_layer("spliced", Layer::Dense(array![[1.0], [0.0]]))
            .unwrap()
            .with_layer("unspliced", Layer::Dense(array![[3.0], [0.0]]))
            .unwrap();
        let proportions = show_proportions(&data);
        assert_abs_diff_eq!(proportions[0].1, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(proportions[1].1, 0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_cleanup_layers() {
        let mut data = create_dataset();
        data.insert_var("velocity_gamma", VarColumn::Float(vec![1.0, 2.0]))
            .unwrap();

        cleanup(&mut data, &[CleanTarget::Layers], &DEFAULT_KEEP);

        assert_eq!(data.layer_keys(), vec!["spliced".to_string(), "unspliced".to_string()]);
        assert!(data.var("velocity_gamma").is_some());

        cleanup(&mut data, &[CleanTarget::All], &["spliced"]);
        assert_eq!(data.layer_keys(), vec!["spliced".to_string()]);
        assert!(data.var_keys().is_empty());
    }
}
