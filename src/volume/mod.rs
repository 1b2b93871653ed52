//! NIfTI-1 volumes: voxel arrays plus the header geometry that places them
//! in world space.

use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayD, Axis};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use snafu::prelude::*;

pub mod geometry;

pub use geometry::{canonical_axes, reoriented_affine, Affine, Geometry};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not read volume {}", path.display()))]
    ReadVolume {
        path: PathBuf,
        source: nifti::NiftiError,
    },

    #[snafu(display("Could not read header of {}", path.display()))]
    ReadHeader {
        path: PathBuf,
        source: nifti::NiftiError,
    },

    #[snafu(display("Could not write volume {}", path.display()))]
    WriteVolume {
        path: PathBuf,
        source: nifti::NiftiError,
    },
}

/// Voxel data with its geometry. Axes are (x, y, z, ...).
#[derive(Debug, Clone)]
pub struct Volume<T> {
    pub data: ArrayD<T>,
    pub geometry: Geometry,
}

impl<T> Volume<T> {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// Shape and geometry of a volume, read without its voxels.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeHeader {
    pub shape: Vec<usize>,
    pub geometry: Geometry,
}

/// Read a volume with the header's intensity scaling applied.
pub fn read_volume(path: &Path) -> Result<Volume<f64>, Error> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .context(ReadVolumeSnafu { path })?;
    let geometry = Geometry::from_header(obj.header());
    let data = obj
        .into_volume()
        .into_ndarray::<f64>()
        .context(ReadVolumeSnafu { path })?;
    Ok(Volume { data, geometry })
}

pub fn read_header(path: &Path) -> Result<VolumeHeader, Error> {
    let header = NiftiHeader::from_file(path).context(ReadHeaderSnafu { path })?;
    let ndim = (header.dim[0] as usize).min(7);
    let shape = header.dim[1..=ndim].iter().map(|&d| d as usize).collect();
    Ok(VolumeHeader {
        shape,
        geometry: Geometry::from_header(&header),
    })
}

/// Write a floating point intensity volume.
pub fn write_image(path: &Path, data: &Array3<f32>, geometry: &Geometry) -> Result<(), Error> {
    let header = header_for(geometry);
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)
        .context(WriteVolumeSnafu { path })
}

/// Write an unsigned 8-bit label volume.
pub fn write_labels(path: &Path, data: &Array3<u8>, geometry: &Geometry) -> Result<(), Error> {
    let header = header_for(geometry);
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)
        .context(WriteVolumeSnafu { path })
}

fn header_for(geometry: &Geometry) -> NiftiHeader {
    let mut header = NiftiHeader {
        scl_slope: 1.0,
        scl_inter: 0.0,
        ..Default::default()
    };
    geometry.apply_to_header(&mut header);
    header
}

/// Reorder the axes of `data` so its affine is closest to RAS+.
pub fn reorient_to_canonical(data: Array3<f32>, affine: &Affine) -> (Array3<f32>, Affine) {
    let (perm, flip) = canonical_axes(affine);
    let (nx, ny, nz) = data.dim();
    let affine = reoriented_affine(affine, [nx, ny, nz], perm, flip);

    let mut data = data.permuted_axes(perm);
    for (axis, flipped) in flip.iter().enumerate() {
        if *flipped {
            data.invert_axis(Axis(axis));
        }
    }
    (data.as_standard_layout().into_owned(), affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_label_volume_roundtrip_keeps_values_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.nii.gz");
        let data = Array3::from_shape_fn((4, 3, 2), |(x, y, z)| ((x + y + z) % 2) as u8);
        let affine = [
            [-0.8, 0.0, 0.0, 100.0],
            [0.0, -0.8, 0.0, 80.0],
            [0.0, 0.0, 2.0, -50.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let geometry = Geometry::from_affine(&affine);

        write_labels(&path, &data, &geometry).unwrap();
        let volume = read_volume(&path).unwrap();

        assert_eq!(volume.shape(), &[4, 3, 2]);
        for ((x, y, z), &value) in data.indexed_iter() {
            assert_eq!(volume.data[[x, y, z]], value as f64);
        }
        assert_eq!(volume.geometry.sform_code, 1);
        assert_eq!(volume.geometry.srow_x, geometry.srow_x);

        let header = read_header(&path).unwrap();
        assert_eq!(header.shape, vec![4, 3, 2]);
    }

    #[test]
    fn test_qform_only_header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qform.nii");
        let affine = [
            [-0.7, 0.0, 0.0, 120.0],
            [0.0, 0.7, 0.0, -40.0],
            [0.0, 0.0, 2.5, 15.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let mut geometry = Geometry::from_affine(&affine);
        geometry.sform_code = 0;

        write_image(&path, &Array3::zeros((2, 2, 2)), &geometry).unwrap();
        let header = read_header(&path).unwrap();

        assert_eq!(header.geometry.sform_code, 0);
        assert_eq!(header.geometry.qform_code, 1);
        assert_eq!(header.geometry.qoffset, [120.0, -40.0, 15.0]);
        let read = header.geometry.affine();
        for (row, expected) in read.iter().zip(affine.iter()) {
            for (a, b) in row.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4, "{:?} vs {:?}", read, affine);
            }
        }
    }

    #[test]
    fn test_reorient_flips_and_permutes_data() {
        // voxel axis 0 runs along -x
        let affine = [
            [-1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let data = Array3::from_shape_fn((3, 2, 1), |(x, y, _)| (x * 10 + y) as f32);
        let (out, out_affine) = reorient_to_canonical(data, &affine);

        assert_eq!(out.dim(), (3, 2, 1));
        assert_eq!(out[[0, 0, 0]], 20.0);
        assert_eq!(out[[2, 1, 0]], 1.0);
        assert_eq!(out_affine[0][0], 1.0);
        assert_eq!(out_affine[0][3], -2.0);
    }
}
