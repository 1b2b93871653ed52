//! Read a folder of DICOM instances into one volume.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use ndarray::Array3;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::utils::dicom::{slice_spacing_hint, stack_affine, PlaneGeometry};
use crate::utils::list_files_recursive;
use crate::volume::{self, Affine, Geometry};

const ORIENTATION_TOLERANCE: f64 = 1e-3;
const DUPLICATE_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SeriesError {
    #[snafu(display("Could not list {}", path.display()))]
    ListFiles {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("No image slices in {}", path.display()))]
    NoSlices { path: PathBuf },

    #[snafu(display("Could not decode pixel data of {}", path.display()))]
    DecodePixelData {
        path: PathBuf,
        source: dicom_pixeldata::Error,
    },

    #[snafu(display("Missing ImagePositionPatient in {}", path.display()))]
    MissingPosition { path: PathBuf },

    #[snafu(display("Orientation of {} differs from the rest of the series", path.display()))]
    InconsistentOrientation { path: PathBuf },

    #[snafu(display(
        "Matrix of {} is {:?}, expected {:?}",
        path.display(),
        found,
        expected
    ))]
    InconsistentMatrix {
        path: PathBuf,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[snafu(display("{} duplicates slice position {:.3}", path.display(), position))]
    DuplicateSlice { path: PathBuf, position: f64 },

    #[snafu(display(
        "Slice increment {:.3} mm at {} deviates from {:.3} mm by more than {} mm",
        found,
        path.display(),
        expected,
        tolerance
    ))]
    SliceIncrement {
        path: PathBuf,
        expected: f64,
        found: f64,
        tolerance: f64,
    },

    #[snafu(display("{} mixes a multi-frame instance with other instances", path.display()))]
    MixedMultiFrame { path: PathBuf },

    /// Volume could not be written
    Volume { source: volume::Error },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesOptions {
    /// Reorient to the closest canonical RAS+ axis order
    pub reorient: bool,
    pub validate_slice_increment: bool,
    /// mm
    pub slice_increment_tolerance: f64,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            reorient: true,
            validate_slice_increment: true,
            slice_increment_tolerance: 0.2,
        }
    }
}

/// One decoded instance.
struct Instance {
    path: PathBuf,
    plane: PlaneGeometry,
    spacing_hint: Option<f64>,
    frames: usize,
    rows: usize,
    columns: usize,
    samples: usize,
    pixels: Vec<f32>,
}

impl Instance {
    fn frame_len(&self) -> usize {
        self.rows * self.columns * self.samples
    }

    /// First sample of pixel (row, column) of `frame`.
    fn value(&self, frame: usize, row: usize, column: usize) -> f32 {
        self.pixels[frame * self.frame_len() + (row * self.columns + column) * self.samples]
    }
}

/// Open a candidate file. DICOMDIR, non-DICOM files and instances without
/// pixel data yield `None`.
fn open_instance(path: &Path) -> Result<Option<Instance>, SeriesError> {
    if path.file_name() == Some(OsStr::new("DICOMDIR")) {
        debug!("Skipping DICOMDIR {}", path.display());
        return Ok(None);
    }
    let obj: DefaultDicomObject = match dicom_object::open_file(path) {
        Ok(obj) => obj,
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            return Ok(None);
        }
    };
    if obj.element(tags::PIXEL_DATA).is_err() {
        warn!("Skipping {}: no pixel data", path.display());
        return Ok(None);
    }

    let decoded = obj.decode_pixel_data().context(DecodePixelDataSnafu { path })?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
    let pixels: Vec<f32> = decoded
        .to_vec_with_options(&options)
        .context(DecodePixelDataSnafu { path })?;

    Ok(Some(Instance {
        path: path.to_path_buf(),
        plane: PlaneGeometry::read(&obj),
        spacing_hint: slice_spacing_hint(&obj),
        frames: decoded.number_of_frames() as usize,
        rows: decoded.rows() as usize,
        columns: decoded.columns() as usize,
        samples: decoded.samples_per_pixel() as usize,
        pixels,
    }))
}

/// Read the series in `folder` as a volume indexed (column, row, slice) and
/// its voxel-to-RAS affine.
pub fn read_series(folder: &Path, options: &SeriesOptions) -> Result<(Array3<f32>, Affine), SeriesError> {
    let files = list_files_recursive(folder).context(ListFilesSnafu { path: folder })?;
    let mut instances = Vec::new();
    for file in &files {
        if let Some(instance) = open_instance(file)? {
            instances.push(instance);
        }
    }
    ensure!(!instances.is_empty(), NoSlicesSnafu { path: folder });
    debug!("{} instances in {}", instances.len(), folder.display());

    if instances.iter().any(|i| i.frames > 1) {
        ensure!(instances.len() == 1, MixedMultiFrameSnafu { path: folder });
        let instance = instances.remove(0);
        return Ok(multi_frame_volume(&instance));
    }

    let first = &instances[0];
    let (rows, columns) = (first.rows, first.columns);
    for instance in &instances[1..] {
        ensure!(
            instance.plane.same_orientation(&first.plane, ORIENTATION_TOLERANCE),
            InconsistentOrientationSnafu { path: &instance.path }
        );
        ensure!(
            (instance.rows, instance.columns) == (rows, columns),
            InconsistentMatrixSnafu {
                path: &instance.path,
                expected: (rows, columns),
                found: (instance.rows, instance.columns),
            }
        );
    }

    if instances.len() == 1 {
        let instance = &instances[0];
        return Ok(stack(
            &instances,
            instance.spacing_hint.unwrap_or(1.0),
            instance.plane.position.unwrap_or([0.0; 3]),
        ));
    }

    let mut positions = Vec::with_capacity(instances.len());
    for instance in &instances {
        let projection = instance
            .plane
            .projection()
            .context(MissingPositionSnafu { path: &instance.path })?;
        positions.push(projection);
    }
    let mut order: Vec<usize> = (0..instances.len()).collect();
    order.sort_by(|&a, &b| positions[a].total_cmp(&positions[b]));

    let increments: Vec<f64> = order.windows(2).map(|w| positions[w[1]] - positions[w[0]]).collect();
    for (pair, increment) in order.windows(2).zip(&increments) {
        ensure!(
            increment.abs() > DUPLICATE_TOLERANCE,
            DuplicateSliceSnafu {
                path: &instances[pair[1]].path,
                position: positions[pair[1]],
            }
        );
    }

    let expected = increments[0];
    for (pair, &found) in order.windows(2).zip(&increments) {
        if (found - expected).abs() <= options.slice_increment_tolerance {
            continue;
        }
        let path = &instances[pair[1]].path;
        ensure!(
            !options.validate_slice_increment,
            SliceIncrementSnafu {
                path,
                expected,
                found,
                tolerance: options.slice_increment_tolerance,
            }
        );
        warn!(
            "Slice increment {:.3} mm at {} deviates from {:.3} mm, using the mean",
            found,
            path.display(),
            expected
        );
    }
    let spacing = increments.iter().sum::<f64>() / increments.len() as f64;

    let sorted: Vec<Instance> = {
        let mut slots: Vec<Option<Instance>> = instances.into_iter().map(Some).collect();
        order.iter().filter_map(|&i| slots[i].take()).collect()
    };
    let origin = sorted[0].plane.position.unwrap_or([0.0; 3]);
    Ok(stack(&sorted, spacing, origin))
}

/// Stack single-frame instances in the given order.
fn stack(instances: &[Instance], spacing: f64, origin: [f64; 3]) -> (Array3<f32>, Affine) {
    let first = &instances[0];
    let data = Array3::from_shape_fn((first.columns, first.rows, instances.len()), |(c, r, k)| {
        instances[k].value(0, r, c)
    });
    (data, stack_affine(&first.plane, spacing, origin))
}

fn multi_frame_volume(instance: &Instance) -> (Array3<f32>, Affine) {
    let spacing = instance.spacing_hint.unwrap_or_else(|| {
        warn!("{} has no slice spacing, assuming 1 mm", instance.path.display());
        1.0
    });
    debug!(
        "{} frames of {} used as slices at {} mm",
        instance.frames,
        instance.path.display(),
        spacing
    );
    let data = Array3::from_shape_fn((instance.columns, instance.rows, instance.frames), |(c, r, f)| {
        instance.value(f, r, c)
    });
    let origin = instance.plane.position.unwrap_or([0.0; 3]);
    (data, stack_affine(&instance.plane, spacing, origin))
}

/// Convert one series folder to a volume file.
pub fn convert_series(folder: &Path, output_file: &Path, options: &SeriesOptions) -> Result<(), SeriesError> {
    let (data, affine) = read_series(folder, options)?;
    let (data, affine) = if options.reorient {
        volume::reorient_to_canonical(data, &affine)
    } else {
        (data, affine)
    };
    volume::write_image(output_file, &data, &Geometry::from_affine(&affine)).context(VolumeSnafu)
}
