//! Payload decoding into a normalized pixel array.
//!
//! Annotation platforms hand out DICOM files, bare DICOM data sets, NIfTI
//! volumes and plain raster images. All of them come out of
//! [`decode_pixels`] as an array indexed (frame, channel, height, width).

use std::io::Write;

use dicom_dictionary_std::{tags, uids};
use dicom_object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use dicom_transfer_syntax_registry::entries;
use image::DynamicImage;
use ndarray::{Array3, Array4, ArrayD, Axis, Ix4};
use snafu::prelude::*;
use tracing::debug;

use crate::utils::dicom::{slice_spacing_hint, stack_affine, PlaneGeometry};
use crate::volume::{self, Geometry};

const DICOM_MAGIC_OFFSET: usize = 128;
const NIFTI_MAGIC_OFFSET: usize = 344;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// Payload is empty
    EmptyPayload,

    #[snafu(display("Could not stage payload in a temporary file"))]
    StagePayload { source: std::io::Error },

    #[snafu(display("Could not read DICOM payload"))]
    ReadDicom {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[snafu(display("Could not decode DICOM pixel data"))]
    DecodePixelData { source: dicom_pixeldata::Error },

    #[snafu(display("Could not decode raster image"))]
    DecodeImage { source: image::ImageError },

    #[snafu(display("Could not read NIfTI payload"))]
    ReadNifti { source: volume::Error },

    #[snafu(display("Unsupported array shape {:?}", shape))]
    UnsupportedShape { shape: Vec<usize> },

    /// Payload format was not recognized
    UnknownFormat,
}

/// What a payload looks like from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Dicom,
    Nifti { gzipped: bool },
    Raster,
    /// Nothing matched; may still be a DICOM data set without preamble
    Unknown,
}

pub fn sniff(bytes: &[u8]) -> PayloadKind {
    if bytes.get(DICOM_MAGIC_OFFSET..DICOM_MAGIC_OFFSET + 4) == Some(b"DICM") {
        PayloadKind::Dicom
    } else if bytes.starts_with(&GZIP_MAGIC) {
        PayloadKind::Nifti { gzipped: true }
    } else if bytes.get(NIFTI_MAGIC_OFFSET..NIFTI_MAGIC_OFFSET + 4) == Some(b"n+1\0") {
        PayloadKind::Nifti { gzipped: false }
    } else if image::guess_format(bytes).is_ok() {
        PayloadKind::Raster
    } else {
        PayloadKind::Unknown
    }
}

/// Decoded pixels, indexed (frame, channel, height, width).
///
/// `geometry` is present when the payload carried one.
#[derive(Debug, Clone)]
pub struct PixelArray {
    pub data: Array4<f32>,
    pub geometry: Option<Geometry>,
}

impl PixelArray {
    pub fn frames(&self) -> usize {
        self.data.dim().0
    }

    pub fn channels(&self) -> usize {
        self.data.dim().1
    }

    /// Reverse the frame order in place.
    pub fn reverse_frames(&mut self) {
        self.data.invert_axis(Axis(0));
    }

    /// One channel as a volume indexed (x, y, z) = (width, height, frame).
    pub fn channel_volume(&self, channel: usize) -> Array3<f32> {
        let channel = channel.min(self.channels().saturating_sub(1));
        self.data
            .index_axis(Axis(1), channel)
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned()
    }
}

pub fn decode_pixels(bytes: &[u8]) -> Result<PixelArray, DecodeError> {
    ensure!(!bytes.is_empty(), EmptyPayloadSnafu);

    let kind = sniff(bytes);
    debug!("Decoding {} byte payload as {:?}", bytes.len(), kind);
    match kind {
        PayloadKind::Dicom => {
            let staged = stage(bytes, ".dcm")?;
            let obj = dicom_object::open_file(staged.path())
                .map_err(Box::from)
                .context(ReadDicomSnafu)?;
            decode_dicom(&obj)
        }
        PayloadKind::Nifti { gzipped } => {
            let staged = stage(bytes, if gzipped { ".nii.gz" } else { ".nii" })?;
            let volume = volume::read_volume(staged.path()).context(ReadNiftiSnafu)?;
            let geometry = volume.geometry;
            Ok(PixelArray {
                data: volume_to_frames(volume.data)?,
                geometry: Some(geometry),
            })
        }
        PayloadKind::Raster => decode_raster(bytes),
        PayloadKind::Unknown => {
            let obj = read_bare_dataset(bytes)?;
            decode_dicom(&obj)
        }
    }
}

/// Write `bytes` to a temporary file whose name ends with `suffix`, for
/// readers that only accept paths.
fn stage(bytes: &[u8], suffix: &str) -> Result<tempfile::NamedTempFile, DecodeError> {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .context(StagePayloadSnafu)?;
    file.write_all(bytes).context(StagePayloadSnafu)?;
    file.flush().context(StagePayloadSnafu)?;
    Ok(file)
}

/// Parse a data set without preamble or file meta group, trying explicit
/// then implicit VR little endian, and attach a minimal meta group.
fn read_bare_dataset(bytes: &[u8]) -> Result<DefaultDicomObject, DecodeError> {
    let (obj, ts_uid) = InMemDicomObject::read_dataset_with_ts(
        bytes,
        &entries::EXPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map(|obj| (obj, uids::EXPLICIT_VR_LITTLE_ENDIAN))
    .or_else(|_| {
        InMemDicomObject::read_dataset_with_ts(bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map(|obj| (obj, uids::IMPLICIT_VR_LITTLE_ENDIAN))
    })
    .map_err(|_| DecodeError::UnknownFormat)?;

    ensure!(obj.element(tags::PIXEL_DATA).is_ok(), UnknownFormatSnafu);

    let text = |tag| {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').to_string())
    };
    let sop_class = text(tags::SOP_CLASS_UID).unwrap_or_else(|| uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string());
    let sop_instance = text(tags::SOP_INSTANCE_UID).unwrap_or_else(|| "2.25.0".to_string());

    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(ts_uid)
            .media_storage_sop_class_uid(sop_class)
            .media_storage_sop_instance_uid(sop_instance),
    )
    .map_err(Box::from)
    .context(ReadDicomSnafu)
}

fn decode_dicom(obj: &DefaultDicomObject) -> Result<PixelArray, DecodeError> {
    let decoded = obj.decode_pixel_data().context(DecodePixelDataSnafu)?;
    let frames = decoded.number_of_frames() as usize;
    let rows = decoded.rows() as usize;
    let columns = decoded.columns() as usize;
    let samples = decoded.samples_per_pixel() as usize;

    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
    let values: Vec<f32> = decoded
        .to_vec_with_options(&options)
        .context(DecodePixelDataSnafu)?;

    let shape = vec![frames, rows, columns, samples];
    let data = Array4::from_shape_vec((frames, rows, columns, samples), values)
        .ok()
        .context(UnsupportedShapeSnafu { shape })?
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned();

    Ok(PixelArray {
        data,
        geometry: dicom_geometry(obj),
    })
}

fn dicom_geometry(obj: &InMemDicomObject) -> Option<Geometry> {
    let plane = PlaneGeometry::read(obj);
    if !plane.has_orientation && obj.element(tags::PIXEL_SPACING).is_err() {
        return None;
    }
    let spacing = slice_spacing_hint(obj).unwrap_or(1.0);
    let origin = plane.position.unwrap_or([0.0; 3]);
    Some(Geometry::from_affine(&stack_affine(&plane, spacing, origin)))
}

/// (x, y[, z[, t]]) volume to (frame, channel, height, width).
fn volume_to_frames(data: ArrayD<f64>) -> Result<Array4<f32>, DecodeError> {
    let shape = data.shape().to_vec();
    let mut data = data;
    while data.ndim() < 4 {
        let axis = Axis(data.ndim());
        data = data.insert_axis(axis);
    }
    let data = data
        .into_dimensionality::<Ix4>()
        .ok()
        .context(UnsupportedShapeSnafu { shape })?;

    Ok(data
        .permuted_axes([2, 3, 1, 0])
        .mapv(|v| v as f32)
        .as_standard_layout()
        .into_owned())
}

fn decode_raster(bytes: &[u8]) -> Result<PixelArray, DecodeError> {
    let img = image::load_from_memory(bytes).context(DecodeImageSnafu)?;
    let (width, height) = (img.width() as usize, img.height() as usize);

    let (channels, values): (usize, Vec<f32>) = match img {
        DynamicImage::ImageLuma8(buf) => (1, buf.into_raw().into_iter().map(f32::from).collect()),
        DynamicImage::ImageLuma16(buf) => (1, buf.into_raw().into_iter().map(f32::from).collect()),
        DynamicImage::ImageLumaA8(_) => (1, img.to_luma8().into_raw().into_iter().map(f32::from).collect()),
        DynamicImage::ImageLumaA16(_) => (1, img.to_luma16().into_raw().into_iter().map(f32::from).collect()),
        other => (3, other.to_rgb8().into_raw().into_iter().map(f32::from).collect()),
    };

    let shape = vec![1, height, width, channels];
    let data = Array4::from_shape_vec((1, height, width, channels), values)
        .ok()
        .context(UnsupportedShapeSnafu { shape })?
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned();

    Ok(PixelArray { data, geometry: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_sniff() {
        let mut dicom = vec![0u8; 132];
        dicom[128..132].copy_from_slice(b"DICM");
        assert_eq!(sniff(&dicom), PayloadKind::Dicom);

        assert_eq!(sniff(&[0x1f, 0x8b, 8, 0]), PayloadKind::Nifti { gzipped: true });

        let mut nifti = vec![0u8; 352];
        nifti[344..348].copy_from_slice(b"n+1\0");
        assert_eq!(sniff(&nifti), PayloadKind::Nifti { gzipped: false });

        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n"), PayloadKind::Raster);
        assert_eq!(sniff(b"nothing"), PayloadKind::Unknown);
    }

    #[test]
    fn test_empty_payload() {
        assert!(matches!(decode_pixels(&[]), Err(DecodeError::EmptyPayload)));
    }

    #[test]
    fn test_grayscale_png_is_one_frame() {
        let img = image::GrayImage::from_fn(3, 2, |x, y| image::Luma([(10 * y + x) as u8]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();

        let pixels = decode_pixels(bytes.get_ref()).unwrap();
        assert_eq!(pixels.data.dim(), (1, 1, 2, 3));
        assert_eq!(pixels.data[[0, 0, 1, 2]], 12.0);
        assert!(pixels.geometry.is_none());

        let volume = pixels.channel_volume(0);
        assert_eq!(volume.dim(), (3, 2, 1));
        assert_eq!(volume[[2, 1, 0]], 12.0);
    }

    #[test]
    fn test_nifti_payload_maps_z_to_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.nii.gz");
        let data = Array3::from_shape_fn((4, 3, 2), |(x, y, z)| (x + 10 * y + 100 * z) as u8);
        volume::write_labels(&path, &data, &Geometry::default()).unwrap();

        let mut pixels = decode_pixels(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(pixels.data.dim(), (2, 1, 3, 4));
        assert_eq!(pixels.frames(), 2);
        assert_eq!(pixels.data[[1, 0, 2, 3]], 123.0);
        assert_eq!(pixels.channel_volume(0), data.mapv(f32::from));

        pixels.reverse_frames();
        assert_eq!(pixels.data[[0, 0, 2, 3]], 123.0);
    }

    #[test]
    fn test_garbage_is_unknown_format() {
        let err = decode_pixels(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFormat), "{}", err);
    }
}
