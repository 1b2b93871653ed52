//! Case matcher and mask merger.
//!
//! Pairs every image with the masks sharing its case key, assigns sequential
//! case identifiers and lays the result out as training and test splits.
//!
//! Both directory listings are sorted by file name before use. Case
//! identifiers follow the sorted image order, so a re-run on unchanged inputs
//! reproduces the same file names and manifest on any filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{case_id, DatasetConfig};
use crate::utils::{file_name_string, list_files_with_ending, progress_bar};
use crate::volume;

pub mod manifest;
pub mod merge;

pub use manifest::{ManifestWriter, MANIFEST_HEADER, NO_MASKS};
pub use merge::{load_and_merge, MaskMerger};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Could not list directory {}", path.display()))]
    ListDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not create dataset folders under {}", path.display()))]
    CreateLayout {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not copy {} to {}", from.display(), to.display()))]
    CopyImage {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write manifest {}", path.display()))]
    WriteManifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Invalid mask shape {:?} in {}", shape, path.display()))]
    InvalidMaskShape { path: PathBuf, shape: Vec<usize> },

    #[snafu(display("Non-integer values in mask {}", path.display()))]
    NonIntegerMask { path: PathBuf },

    #[snafu(display(
        "Shape mismatch in {}: expected {:?}, found {:?}",
        path.display(),
        expected,
        found
    ))]
    MaskShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Volume could not be read or written
    Volume { source: volume::Error },
}

/// Options of a matcher run.
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub config: DatasetConfig,
    /// Where to write the manifest; defaults to the manifest file name in the
    /// current directory
    pub manifest_path: Option<PathBuf>,
    pub verbose: bool,
}

/// One image with its assigned identifier and the masks of its case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasePlan {
    pub case_id: String,
    pub key: String,
    pub image: PathBuf,
    pub masks: Vec<PathBuf>,
}

impl CasePlan {
    pub fn is_training(&self) -> bool {
        !self.masks.is_empty()
    }
}

/// Outcome of a matcher run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchReport {
    pub train_cases: Vec<String>,
    pub test_cases: Vec<String>,
    pub manifest_path: PathBuf,
    /// Mask keys without a matching image
    pub orphan_mask_keys: Vec<String>,
}

impl MatchReport {
    pub fn num_training(&self) -> usize {
        self.train_cases.len()
    }
}

/// Case key of an image file: the name without its file ending.
pub fn image_case_key<'a>(file_name: &'a str, file_ending: &str) -> &'a str {
    file_name.strip_suffix(file_ending).unwrap_or(file_name)
}

/// Case key of a mask file: everything before the first `marker`.
pub fn mask_case_key<'a>(file_name: &'a str, marker: &str) -> &'a str {
    file_name.split(marker).next().unwrap_or(file_name)
}

/// Map each case key to its mask files, in sorted file name order.
pub fn build_mask_map(masks_dir: &Path, config: &DatasetConfig) -> Result<BTreeMap<String, Vec<PathBuf>>, Error> {
    let mask_files = list_files_with_ending(masks_dir, &config.file_ending)
        .context(ListDirectorySnafu { path: masks_dir })?;

    let mut mask_map: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for mask in mask_files {
        let name = file_name_string(&mask);
        let key = mask_case_key(&name, &config.mask_marker).to_string();
        mask_map.entry(key).or_default().push(mask);
    }
    Ok(mask_map)
}

/// Assign case identifiers to every image and attach the masks of its case.
///
/// Returns the plans in identifier order and the mask keys no image claimed.
pub fn plan_cases(
    images_dir: &Path,
    masks_dir: &Path,
    config: &DatasetConfig,
) -> Result<(Vec<CasePlan>, Vec<String>), Error> {
    let mut mask_map = build_mask_map(masks_dir, config)?;
    info!("Found {} mask keys in {}", mask_map.len(), masks_dir.display());

    let image_files = list_files_with_ending(images_dir, &config.file_ending)
        .context(ListDirectorySnafu { path: images_dir })?;

    let plans = image_files
        .into_iter()
        .enumerate()
        .map(|(index, image)| {
            let name = file_name_string(&image);
            let key = image_case_key(&name, &config.file_ending).to_string();
            let masks = mask_map.remove(&key).unwrap_or_default();
            CasePlan {
                case_id: case_id(index + 1),
                key,
                image,
                masks,
            }
        })
        .collect();

    let orphans = mask_map.into_keys().collect();
    Ok((plans, orphans))
}

/// Lay out images and merged masks as a training dataset.
///
/// Every mask of every training case is validated before anything is
/// written; a bad mask aborts the run with no output. The returned report
/// lists the training cases for descriptor emission.
pub fn convert_to_dataset(
    images_dir: &Path,
    masks_dir: &Path,
    output_base: &Path,
    options: &MatchOptions,
) -> Result<MatchReport, Error> {
    let config = &options.config;
    let (plans, orphan_mask_keys) = plan_cases(images_dir, masks_dir, config)?;
    for key in &orphan_mask_keys {
        warn!("Masks with key '{}' have no matching image", key);
    }

    for plan in plans.iter().filter(|p| p.is_training()) {
        debug!("Validating {} masks of '{}'", plan.masks.len(), plan.key);
        load_and_merge(&plan.masks)?;
    }

    let layout = config.layout(output_base);
    layout.create().context(CreateLayoutSnafu { path: &layout.root })?;

    let manifest_path = options
        .manifest_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(config.manifest_file_name()));
    let mut manifest = ManifestWriter::create(&manifest_path)
        .context(WriteManifestSnafu { path: &manifest_path })?;
    info!("Writing manifest to {}", manifest.path().display());

    let mut train_cases = Vec::new();
    let mut test_cases = Vec::new();
    let bar = progress_bar(plans.len(), options.verbose);

    for plan in &plans {
        if let Some(bar) = bar.as_ref() {
            bar.set_message(plan.key.clone());
        }

        let image_name = config.image_file_name(&plan.case_id);
        if plan.is_training() {
            let image_dst = layout.images_tr.join(&image_name);
            copy_image(&plan.image, &image_dst)?;

            let reference = volume::read_header(&plan.image).context(VolumeSnafu)?;
            if let Some(merged) = load_and_merge(&plan.masks)? {
                if merged.shape() != &reference.shape[..reference.shape.len().min(3)] {
                    warn!(
                        "Merged mask of '{}' has shape {:?}, image {} has {:?}",
                        plan.key,
                        merged.shape(),
                        plan.image.display(),
                        reference.shape
                    );
                }
                let label_dst = layout.labels_tr.join(config.label_file_name(&plan.case_id));
                volume::write_labels(&label_dst, &merged, &reference.geometry).context(VolumeSnafu)?;
            }

            info!("{} <- {} ({} masks)", plan.case_id, plan.key, plan.masks.len());
            train_cases.push(plan.case_id.clone());
        } else {
            let image_dst = layout.images_ts.join(&image_name);
            copy_image(&plan.image, &image_dst)?;

            info!("{} <- {} (test)", plan.case_id, plan.key);
            test_cases.push(plan.case_id.clone());
        }

        manifest
            .record(&plan.case_id, &plan.image, &plan.masks)
            .context(WriteManifestSnafu { path: manifest.path() })?;
        if let Some(bar) = bar.as_ref() {
            bar.inc(1);
        }
    }

    if let Some(bar) = bar {
        bar.finish_with_message("done");
    }
    let manifest_path = manifest
        .finish()
        .context(WriteManifestSnafu { path: &manifest_path })?;

    Ok(MatchReport {
        train_cases,
        test_cases,
        manifest_path,
        orphan_mask_keys,
    })
}

fn copy_image(from: &Path, to: &Path) -> Result<(), Error> {
    std::fs::copy(from, to).context(CopyImageSnafu { from, to })?;
    Ok(())
}
