use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayD, Axis, Ix3, Zip};
use snafu::prelude::*;
use tracing::debug;

use super::{Error, InvalidMaskShapeSnafu, MaskShapeMismatchSnafu, NonIntegerMaskSnafu, VolumeSnafu};
use crate::volume;

/// Same tolerance as numpy's `allclose` defaults.
const RTOL: f64 = 1e-5;
const ATOL: f64 = 1e-8;

pub fn is_integral(value: f64) -> bool {
    let rounded = value.round();
    (value - rounded).abs() <= ATOL + RTOL * rounded.abs()
}

/// Bring a mask to three dimensions. A trailing singleton fourth axis is
/// dropped; any other non-3-D shape is rejected.
pub fn normalize_mask(data: ArrayD<f64>, path: &Path) -> Result<Array3<f64>, Error> {
    let data = if data.ndim() == 4 && data.shape()[3] == 1 {
        data.index_axis_move(Axis(3), 0)
    } else {
        data
    };
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>()
        .ok()
        .context(InvalidMaskShapeSnafu { path, shape })
}

/// Map an integer-valued mask to {0, 1}.
pub fn binarize(data: &Array3<f64>, path: &Path) -> Result<Array3<u8>, Error> {
    ensure!(data.iter().all(|&v| is_integral(v)), NonIntegerMaskSnafu { path });
    Ok(data.mapv(|v| u8::from(v.round() != 0.0)))
}

/// Running logical OR over the masks of one case.
#[derive(Debug, Default)]
pub struct MaskMerger {
    merged: Option<Array3<u8>>,
    sources: Vec<PathBuf>,
}

impl MaskMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `data` and fold it into the merged mask.
    pub fn add(&mut self, data: ArrayD<f64>, path: &Path) -> Result<(), Error> {
        let mask = normalize_mask(data, path)?;
        let mask = binarize(&mask, path)?;

        match self.merged.as_mut() {
            None => self.merged = Some(mask),
            Some(merged) => {
                ensure!(
                    merged.dim() == mask.dim(),
                    MaskShapeMismatchSnafu {
                        path,
                        expected: merged.shape().to_vec(),
                        found: mask.shape().to_vec(),
                    }
                );
                Zip::from(merged).and(&mask).for_each(|m, &v| *m |= v);
            }
        }
        self.sources.push(path.to_path_buf());
        Ok(())
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// The merged mask, or `None` when nothing was added.
    pub fn finish(self) -> Option<Array3<u8>> {
        self.merged
    }
}

/// Read every mask in `paths` and merge them into one label volume.
pub fn load_and_merge(paths: &[PathBuf]) -> Result<Option<Array3<u8>>, Error> {
    let mut merger = MaskMerger::new();
    for path in paths {
        let volume = volume::read_volume(path).context(VolumeSnafu)?;
        debug!("Loaded mask {} with shape {:?}", path.display(), volume.shape());
        merger.add(volume.data, path)?;
    }
    debug!("Merged {} masks", merger.sources().len());
    Ok(merger.finish())
}
