//! Resource and segmentation download from the annotation platform.

use std::path::{Path, PathBuf};

use ndarray::Array3;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_FILE_ENDING, DEFAULT_IMAGES_DIR, DEFAULT_MASKS_DIR, DEFAULT_MASK_MARKER, DEFAULT_RESOURCES_DIR};
use crate::matcher::merge::is_integral;
use crate::utils::{maybe_mkdir, progress_bar, resource_base_name};
use crate::volume::{self, Geometry};

pub mod client;
pub mod decode;

pub use client::{Annotation, AnnotationPlatform, CachedPlatform, ClientError, PlatformClient, Project, Resource};
pub use decode::{decode_pixels, DecodeError, PixelArray};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Project '{}' not found", name))]
    ProjectNotFound { name: String },

    #[snafu(display("Annotation platform request failed"))]
    Client { source: ClientError },

    #[snafu(display("Could not decode payload of '{}'", name))]
    Decode { name: String, source: DecodeError },

    #[snafu(display("Non-integer values in mask '{}'", name))]
    NonIntegerMask { name: String },

    #[snafu(display("Could not create {}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Volume could not be written
    Volume { source: volume::Error },
}

/// How fetched payloads are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AcquisitionStrategy {
    /// Decode payloads and save them as volumes
    #[default]
    Decoded,
    /// Save payload bytes verbatim
    Raw,
}

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub project_name: String,
    pub strategy: AcquisitionStrategy,
    /// Raw resource payloads, one folder per resource
    pub resources_dir: PathBuf,
    /// Decoded image volumes
    pub images_dir: PathBuf,
    pub masks_dir: PathBuf,
    pub load_ai_segmentations: bool,
    /// Reverse decoded masks along the frame axis
    pub reverse_mask_slices: bool,
    pub file_ending: String,
    pub mask_marker: String,
    pub verbose: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            strategy: AcquisitionStrategy::default(),
            resources_dir: PathBuf::from(DEFAULT_RESOURCES_DIR),
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            masks_dir: PathBuf::from(DEFAULT_MASKS_DIR),
            load_ai_segmentations: true,
            reverse_mask_slices: false,
            file_ending: DEFAULT_FILE_ENDING.to_string(),
            mask_marker: DEFAULT_MASK_MARKER.to_string(),
            verbose: false,
        }
    }
}

impl AcquireOptions {
    fn mask_path(&self, base: &str, n: usize) -> PathBuf {
        self.masks_dir
            .join(format!("{}{}_{}{}", base, self.mask_marker, n, self.file_ending))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub resources: usize,
    pub images: Vec<PathBuf>,
    pub masks: Vec<PathBuf>,
}

/// Fetch every resource of the project and its segmentations.
pub async fn acquire<P>(platform: &P, options: &AcquireOptions) -> Result<AcquisitionReport, Error>
where
    P: AnnotationPlatform + ?Sized,
{
    let project = platform
        .project_by_name(&options.project_name)
        .await
        .context(ClientSnafu)?
        .context(ProjectNotFoundSnafu {
            name: &options.project_name,
        })?;
    info!("Project '{}' found with id {}", project.name, project.id);

    let resources = platform.project_resources(&project).await.context(ClientSnafu)?;
    info!("{} resources to fetch", resources.len());

    let mut report = AcquisitionReport {
        resources: resources.len(),
        ..Default::default()
    };
    let bar = progress_bar(resources.len(), options.verbose);

    for resource in &resources {
        let base = resource_base_name(&resource.filename);
        if let Some(bar) = bar.as_ref() {
            bar.set_message(base.clone());
        }

        let bytes = platform.resource_bytes(resource).await.context(ClientSnafu)?;
        let geometry = match options.strategy {
            AcquisitionStrategy::Raw => {
                let path = options.resources_dir.join(&base).join(format!("{}.dcm", base));
                write_bytes(&path, &bytes)?;
                report.images.push(path);
                None
            }
            AcquisitionStrategy::Decoded => {
                let (path, geometry) = save_image(&bytes, &base, options)?;
                report.images.push(path);
                Some(geometry)
            }
        };

        let annotations = platform
            .annotations(resource, options.load_ai_segmentations)
            .await
            .context(ClientSnafu)?;
        let segmentations: Vec<&Annotation> = annotations.iter().filter(|a| a.is_segmentation()).collect();
        debug!("{} segmentations for '{}'", segmentations.len(), base);

        for (n, annotation) in segmentations.into_iter().enumerate() {
            debug!(
                "Segmentation {} of '{}': id {}, identifier {:?}, model {}",
                n, base, annotation.id, annotation.identifier, annotation.is_model
            );
            let bytes = platform.annotation_bytes(annotation).await.context(ClientSnafu)?;
            let path = options.mask_path(&base, n);
            match geometry.as_ref() {
                None => write_bytes(&path, &bytes)?,
                Some(geometry) => save_mask(&bytes, &path, geometry, options.reverse_mask_slices)?,
            }
            report.masks.push(path);
        }

        info!("Fetched '{}'", base);
        if let Some(bar) = bar.as_ref() {
            bar.inc(1);
        }
    }

    if let Some(bar) = bar {
        bar.finish_with_message("done");
    }
    Ok(report)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    ensure_parent(path)?;
    std::fs::write(path, bytes).context(WriteFileSnafu { path })
}

fn ensure_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        maybe_mkdir(parent).context(CreateDirSnafu { path: parent })?;
    }
    Ok(())
}

fn save_image(bytes: &[u8], base: &str, options: &AcquireOptions) -> Result<(PathBuf, Geometry), Error> {
    let pixels = decode_pixels(bytes).context(DecodeSnafu { name: base })?;
    if pixels.channels() > 1 {
        warn!("'{}' has {} channels, keeping the first", base, pixels.channels());
    }
    debug!("'{}' decoded with {} frames", base, pixels.frames());
    let geometry = pixels.geometry.unwrap_or_default();
    let data = pixels.channel_volume(0);

    let path = options.images_dir.join(format!("{}{}", base, options.file_ending));
    ensure_parent(&path)?;
    volume::write_image(&path, &data, &geometry).context(VolumeSnafu)?;
    Ok((path, geometry))
}

fn save_mask(bytes: &[u8], path: &Path, geometry: &Geometry, reverse: bool) -> Result<(), Error> {
    let name = path.display().to_string();
    let mut pixels = decode_pixels(bytes).context(DecodeSnafu { name: &name })?;
    if reverse {
        pixels.reverse_frames();
    }
    let labels = to_labels(&pixels.channel_volume(0)).context(NonIntegerMaskSnafu { name })?;

    ensure_parent(path)?;
    volume::write_labels(path, &labels, geometry).context(VolumeSnafu)
}

/// Binary labels: any nonzero value is foreground. `None` when a value is
/// not an integer.
fn to_labels(data: &Array3<f32>) -> Option<Array3<u8>> {
    if !data.iter().all(|&v| is_integral(v as f64)) {
        return None;
    }
    Some(data.mapv(|v| u8::from(v.round() != 0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_path() {
        let options = AcquireOptions {
            masks_dir: PathBuf::from("masks"),
            ..Default::default()
        };
        assert_eq!(
            options.mask_path("scan", 2),
            PathBuf::from("masks/scan_segmentation_2.nii.gz")
        );
    }

    #[test]
    fn test_to_labels_binarizes_integer_values() {
        let data = Array3::from_shape_vec((1, 1, 4), vec![-1.0, 0.0, 2.0, 300.0]).unwrap();
        assert_eq!(to_labels(&data).unwrap().into_raw_vec(), vec![1, 0, 1, 1]);
    }

    #[test]
    fn test_to_labels_rejects_fractions() {
        let data = Array3::from_shape_vec((1, 1, 3), vec![0.0, 0.4, 1.0]).unwrap();
        assert!(to_labels(&data).is_none());
    }
}
