use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::volume::Affine;

pub fn element_f64(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

pub fn element_f64s(obj: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

/// In-plane geometry of an image: ImageOrientationPatient,
/// ImagePositionPatient and PixelSpacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneGeometry {
    /// direction of increasing column index
    pub row_dir: [f64; 3],
    /// direction of increasing row index
    pub col_dir: [f64; 3],
    pub position: Option<[f64; 3]>,
    /// (between rows, between columns)
    pub pixel_spacing: [f64; 2],
    /// whether orientation came from the data set rather than the default
    pub has_orientation: bool,
}

impl PlaneGeometry {
    pub fn read(obj: &InMemDicomObject) -> Self {
        let orientation = element_f64s(obj, tags::IMAGE_ORIENTATION_PATIENT).filter(|v| v.len() == 6);
        let (row_dir, col_dir) = match &orientation {
            Some(v) => ([v[0], v[1], v[2]], [v[3], v[4], v[5]]),
            None => ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        };
        let position = element_f64s(obj, tags::IMAGE_POSITION_PATIENT)
            .filter(|v| v.len() == 3)
            .map(|v| [v[0], v[1], v[2]]);
        let pixel_spacing = element_f64s(obj, tags::PIXEL_SPACING)
            .filter(|v| v.len() == 2 && v[0] > 0.0 && v[1] > 0.0)
            .map(|v| [v[0], v[1]])
            .unwrap_or([1.0, 1.0]);

        PlaneGeometry {
            row_dir,
            col_dir,
            position,
            pixel_spacing,
            has_orientation: orientation.is_some(),
        }
    }

    pub fn normal(&self) -> [f64; 3] {
        cross(&self.row_dir, &self.col_dir)
    }

    /// Distance of the image origin along the slice normal.
    pub fn projection(&self) -> Option<f64> {
        self.position.map(|p| dot(&p, &self.normal()))
    }

    pub fn same_orientation(&self, other: &PlaneGeometry, tolerance: f64) -> bool {
        self.row_dir
            .iter()
            .chain(self.col_dir.iter())
            .zip(other.row_dir.iter().chain(other.col_dir.iter()))
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

/// SpacingBetweenSlices, falling back to SliceThickness.
pub fn slice_spacing_hint(obj: &InMemDicomObject) -> Option<f64> {
    element_f64(obj, tags::SPACING_BETWEEN_SLICES)
        .or_else(|| element_f64(obj, tags::SLICE_THICKNESS))
        .filter(|v| *v > 0.0)
}

pub fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Voxel-to-RAS affine of a stack of slices indexed (column, row, slice).
///
/// DICOM patient coordinates are LPS, so the first two world rows are
/// negated.
pub fn stack_affine(plane: &PlaneGeometry, slice_spacing: f64, origin: [f64; 3]) -> Affine {
    let normal = plane.normal();
    let columns = [
        plane.row_dir.map(|v| v * plane.pixel_spacing[1]),
        plane.col_dir.map(|v| v * plane.pixel_spacing[0]),
        normal.map(|v| v * slice_spacing),
    ];

    let mut affine = [[0.0; 4]; 4];
    for (world, row) in affine.iter_mut().take(3).enumerate() {
        let sign = if world < 2 { -1.0 } else { 1.0 };
        for (voxel, column) in columns.iter().enumerate() {
            row[voxel] = sign * column[world];
        }
        row[3] = sign * origin[world];
    }
    affine[3][3] = 1.0;
    affine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axial_stack_affine() {
        let plane = PlaneGeometry {
            row_dir: [1.0, 0.0, 0.0],
            col_dir: [0.0, 1.0, 0.0],
            position: Some([-100.0, -120.0, 30.0]),
            pixel_spacing: [0.5, 0.75],
            has_orientation: true,
        };
        let affine = stack_affine(&plane, 2.0, [-100.0, -120.0, 30.0]);
        assert_eq!(affine[0], [-0.75, 0.0, 0.0, 100.0]);
        assert_eq!(affine[1], [0.0, -0.5, 0.0, 120.0]);
        assert_eq!(affine[2], [0.0, 0.0, 2.0, 30.0]);
        assert_eq!(plane.projection(), Some(30.0));
    }

    #[test]
    fn test_cross_and_dot() {
        assert_eq!(cross(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]), [0.0, 0.0, 1.0]);
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }
}
