//! Top-level velocity computation on a [`Dataset`].

use std::borrow::Cow;

use ndarray::Array2;

use crate::data::{Dataset, Layer, VarColumn};
use crate::error::VelocityError;
use crate::moments::{MS_KEY, MomentsProvider};
use crate::velocity::estimator::Velocity;
use crate::velocity::scope::is_proper_subset;
use crate::velocity::{GroupSelection, VelocityConfig};

/// Grouping annotations tried, in order, when none is given or the given one is missing.
pub const GROUPBY_FALLBACKS: [&str; 2] = ["clusters", "louvain"];

/// Everything a finished fit writes back to the dataset.
struct VelocityFit {
    residual: Array2<f32>,
    residual2: Option<Array2<f32>>,
    pars: Vec<(&'static str, VarColumn)>,
    velocity_genes: Vec<bool>,
}

impl VelocityFit {
    fn collect(velo: &Velocity) -> anyhow::Result<Self> {
        let (residual, residual2) = velo.residuals();
        let residual = residual
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Velocity estimator finished without a residual"))?;
        Ok(VelocityFit {
            residual,
            residual2: residual2.cloned(),
            pars: velo.par_names().into_iter().zip(velo.pars()).collect(),
            velocity_genes: velo.velocity_genes().to_vec(),
        })
    }
}

/// Estimate velocities gene by gene and store them in the dataset.
///
/// Runs the deterministic fit and, for `FitMode::Stochastic`/`FitMode::Bayes`, the stochastic
/// fit. First-order moments are requested from `moments` if the dataset does not carry an `Ms`
/// layer yet (unless `use_raw`).
///
/// # Arguments
///
/// * `data` - Annotated dataset; modified in place unless `config.copy` is set
/// * `moments` - Source of first- and second-order moments
/// * `config` - Fitting mode, offsets, gene filtering and cell selection
///
/// # Returns
///
/// `Some(result)` when `config.copy` is set (the input stays untouched), otherwise `None`.
/// The result holds:
///
/// * layer `<vkey>`: velocity of every cell and gene
/// * layer `variance_<vkey>`: second-order velocity (stochastic modes only)
/// * gene annotations `<vkey>_offset`, `<vkey>_offset2`, `<vkey>_gamma`, `<vkey>_r2`,
///   `<vkey>_genes`, each written only when it holds more than one distinct value
///
/// With a group selection, only the rows of the selected cells are written; other cells keep
/// their previous layer values (zero for a new layer).
///
/// # Errors
///
/// `VelocityError::Configuration` when the group selection cannot be resolved or matches no
/// cell, plus any error raised by the moments provider.
pub fn velocity(
    data: &mut Dataset,
    moments: &dyn MomentsProvider,
    config: &VelocityConfig,
) -> anyhow::Result<Option<Dataset>> {
    if config.copy {
        let mut adata = data.clone();
        velocity_inplace(&mut adata, moments, config)?;
        Ok(Some(adata))
    } else {
        velocity_inplace(data, moments, config)?;
        Ok(None)
    }
}

fn velocity_inplace(
    adata: &mut Dataset,
    moments: &dyn MomentsProvider,
    config: &VelocityConfig,
) -> anyhow::Result<()> {
    if !config.use_raw && !adata.has_layer(MS_KEY) {
        moments.ensure_moments(adata)?;
    }
    let rows = resolve_groups(adata, config.groups.as_ref())?;

    log::info!("computing velocities ({} mode)", config.mode);

    let subset = config.subset_for_fitting.as_deref();
    let mut narrowed: Option<Dataset> = None;

    let fit = {
        let view = group_view(adata, rows.as_deref());
        let mut velo = Velocity::new(&view, subset, config.use_raw)?;
        velo.compute_deterministic(config.fit_offset);

        let mask = velo.velocity_genes().to_vec();
        if !mask.contains(&true) {
            log::warn!("no gene passed the velocity gene rule");
        }

        if !config.mode.is_stochastic() {
            VelocityFit::collect(&velo)?
        } else if config.filter_genes && is_proper_subset(&mask) {
            let deterministic = velo
                .deterministic_fit()
                .ok_or_else(|| anyhow::anyhow!("Deterministic fit missing before gene filtering"))?
                .select_genes(&mask);
            let filtered = adata.subset_vars(&mask)?;
            log::debug!(
                "filtered to {} velocity genes before the stochastic fit",
                filtered.n_vars()
            );

            let fit = {
                let view = group_view(&filtered, rows.as_deref());
                let mut velo = Velocity::resume(&view, subset, deterministic, config.use_raw)?;
                velo.compute_stochastic(
                    config.fit_offset,
                    config.fit_offset2,
                    config.mode,
                    moments,
                    &config.mle,
                )?;
                VelocityFit::collect(&velo)?
            };
            narrowed = Some(filtered);
            fit
        } else {
            velo.compute_stochastic(
                config.fit_offset,
                config.fit_offset2,
                config.mode,
                moments,
                &config.mle,
            )?;
            VelocityFit::collect(&velo)?
        }
    };

    // all fitting is done, write back
    if let Some(filtered) = narrowed {
        *adata = filtered;
    }

    let vkey = config.vkey.as_str();
    write_layer(adata, vkey, rows.as_deref(), fit.residual)?;
    if config.mode.is_stochastic() {
        if let Some(residual2) = fit.residual2 {
            write_layer(adata, &config.variance_key(), rows.as_deref(), residual2)?;
        }
    }

    for (name, column) in fit.pars {
        if !column.is_constant() {
            adata.insert_var(&format!("{}{}", vkey, name), column)?;
        }
    }

    log::info!("    finished");
    log::debug!(
        "added '{}', velocity vectors for each individual cell (layers)",
        vkey
    );

    if config.filter_genes && is_proper_subset(&fit.velocity_genes) {
        adata.subset_vars_inplace(&fit.velocity_genes)?;
    }
    Ok(())
}

/// Rows of the cells belonging to the selected groups, `None` without a selection.
fn resolve_groups(
    data: &Dataset,
    selection: Option<&GroupSelection>,
) -> anyhow::Result<Option<Vec<usize>>> {
    let Some(selection) = selection else {
        return Ok(None);
    };

    let explicit = selection.groupby.as_deref().filter(|key| data.has_obs(key));
    if let (Some(requested), None) = (selection.groupby.as_deref(), explicit) {
        log::warn!(
            "groupby '{}' not found in cell annotations, trying {:?}",
            requested,
            GROUPBY_FALLBACKS
        );
    }

    let groupby = explicit
        .or_else(|| GROUPBY_FALLBACKS.iter().copied().find(|key| data.has_obs(key)))
        .ok_or_else(|| {
            VelocityError::configuration(format!(
                "groupby attribute not valid: none of {:?} found in cell annotations",
                selection
                    .groupby
                    .iter()
                    .map(String::as_str)
                    .chain(GROUPBY_FALLBACKS)
                    .collect::<Vec<_>>()
            ))
        })?;

    let labels = data
        .obs(groupby)
        .ok_or_else(|| VelocityError::configuration(format!("groupby '{}' not found", groupby)))?;
    let rows: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter_map(|(i, label)| selection.groups.contains(label).then_some(i))
        .collect();

    if rows.is_empty() {
        return Err(VelocityError::configuration(format!(
            "no cells in groups {:?} of '{}'",
            selection.groups, groupby
        ))
        .into());
    }
    Ok(Some(rows))
}

fn group_view<'d>(data: &'d Dataset, rows: Option<&[usize]>) -> Cow<'d, Dataset> {
    match rows {
        Some(rows) => Cow::Owned(data.select_obs(rows)),
        None => Cow::Borrowed(data),
    }
}

fn write_layer(
    data: &mut Dataset,
    key: &str,
    rows: Option<&[usize]>,
    values: Array2<f32>,
) -> anyhow::Result<()> {
    match rows {
        Some(rows) => data.write_layer_rows(key, rows, values.view()),
        None => data.insert_layer(key, Layer::Dense(values)),
    }
}
