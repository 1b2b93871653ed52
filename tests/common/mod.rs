#![allow(dead_code)]

use std::path::Path;

use dicom_core::value::PrimitiveValue;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use ndarray::Array3;

use lesion_dataset::volume::{self, Geometry};

/// Synthetic CT instance with 16-bit unsigned pixels.
pub struct CtInstance<'a> {
    pub sop_instance_uid: &'a str,
    pub rows: u16,
    pub columns: u16,
    pub frames: u32,
    pub position: Option<[f64; 3]>,
    pub spacing_between_slices: Option<f64>,
    pub rescale_intercept: Option<f64>,
    /// frame-major, row-major pixel values
    pub pixels: Vec<u16>,
}

fn decimal_strings(values: &[f64]) -> PrimitiveValue {
    PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect())
}

impl CtInstance<'_> {
    pub fn write(&self, path: &Path) {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::CT_IMAGE_STORAGE)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, self.sop_instance_uid)));
        obj.put(DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")));
        obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])));
        obj.put(DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "MONOCHROME2")));
        obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [self.rows])));
        obj.put(DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [self.columns])));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])));
        obj.put(DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])));
        obj.put(DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])));
        obj.put(DataElement::new(tags::PIXEL_SPACING, VR::DS, decimal_strings(&[0.5, 0.5])));
        obj.put(DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            decimal_strings(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        ));
        if let Some(position) = self.position {
            obj.put(DataElement::new(tags::IMAGE_POSITION_PATIENT, VR::DS, decimal_strings(&position)));
        }
        if self.frames > 1 {
            obj.put(DataElement::new(
                tags::NUMBER_OF_FRAMES,
                VR::IS,
                PrimitiveValue::from(self.frames.to_string()),
            ));
        }
        if let Some(spacing) = self.spacing_between_slices {
            obj.put(DataElement::new(tags::SPACING_BETWEEN_SLICES, VR::DS, decimal_strings(&[spacing])));
        }
        if let Some(intercept) = self.rescale_intercept {
            obj.put(DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, decimal_strings(&[intercept])));
            obj.put(DataElement::new(tags::RESCALE_SLOPE, VR::DS, decimal_strings(&[1.0])));
        }
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U16(self.pixels.iter().copied().collect()),
        ));

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(self.sop_instance_uid),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.dcm");
        self.write(&path);
        std::fs::read(path).unwrap()
    }
}

/// Pixel value at (frame, row, column) of the synthetic instances.
pub fn pixel(frame: usize, row: usize, column: usize) -> u16 {
    (frame * 100 + row * 10 + column) as u16
}

/// Single-frame slices of `rows` x `columns` pixels, one per position.
pub fn write_series(dir: &Path, names_and_z: &[(&str, f64)], rows: u16, columns: u16) {
    std::fs::create_dir_all(dir).unwrap();
    for (name, z) in names_and_z {
        // slice index follows position, so sorted data can be checked
        let slice = (*z * 10.0).round() as usize;
        let pixels = (0..rows as usize)
            .flat_map(|r| (0..columns as usize).map(move |c| pixel(slice, r, c)))
            .collect();
        CtInstance {
            sop_instance_uid: "1.2.826.0.1.3680043.2.1125.1",
            rows,
            columns,
            frames: 1,
            position: Some([0.0, 0.0, *z]),
            spacing_between_slices: None,
            rescale_intercept: None,
            pixels,
        }
        .write(&dir.join(name));
    }
}

pub fn write_image(path: &Path, data: &Array3<f32>) {
    volume::write_image(path, data, &Geometry::default()).unwrap();
}

pub fn write_mask(path: &Path, data: &Array3<u8>) {
    volume::write_labels(path, data, &Geometry::default()).unwrap();
}

/// Axis-aligned scanner geometry with a shifted origin and anisotropic spacing.
pub fn scanner_geometry() -> Geometry {
    Geometry::from_affine(&[
        [-0.7, 0.0, 0.0, 120.0],
        [0.0, -0.7, 0.0, 100.0],
        [0.0, 0.0, 2.5, -40.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}

pub fn write_image_with(path: &Path, data: &Array3<f32>, geometry: &Geometry) {
    volume::write_image(path, data, geometry).unwrap();
}
