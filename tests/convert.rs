mod common;

use common::{pixel, write_series, CtInstance};
use lesion_dataset::convert::{self, ConversionOptions, SeriesError, SeriesOptions};
use lesion_dataset::volume::read_volume;

fn options(reorient: bool) -> ConversionOptions {
    ConversionOptions {
        series: SeriesOptions {
            reorient,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_slices_are_stacked_by_position() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    // file name order differs from position order
    write_series(&root.path().join("ct"), &[("a.dcm", 4.0), ("b.dcm", 0.0), ("c.dcm", 2.0)], 2, 3);

    let report = convert::convert_all(root.path(), out.path(), &options(false)).unwrap();
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.converted, vec![out.path().join("ct.nii.gz")]);

    let volume = read_volume(&report.converted[0]).unwrap();
    assert_eq!(volume.shape(), &[3, 2, 3]);
    for (k, slice) in [0, 20, 40].into_iter().enumerate() {
        assert_eq!(volume.data[[2, 1, k]], pixel(slice, 1, 2) as f64);
    }
    assert_eq!(volume.geometry.spacing(), [0.5, 0.5, 2.0]);

    // LPS to RAS flips the in-plane axes
    let affine = volume.geometry.affine();
    assert_eq!(affine[0][0], -0.5);
    assert_eq!(affine[1][1], -0.5);
    assert_eq!(affine[2][2], 2.0);
}

#[test]
fn test_reorientation_flips_to_ras() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_series(&root.path().join("ct"), &[("0.dcm", 0.0), ("1.dcm", 2.0)], 2, 3);

    let report = convert::convert_all(root.path(), out.path(), &options(true)).unwrap();
    let volume = read_volume(&report.converted[0]).unwrap();

    assert_eq!(volume.shape(), &[3, 2, 2]);
    assert_eq!(volume.data[[0, 0, 1]], pixel(20, 1, 2) as f64);
    let affine = volume.geometry.affine();
    assert!(affine[0][0] > 0.0 && affine[1][1] > 0.0 && affine[2][2] > 0.0);
}

#[test]
fn test_bad_series_does_not_abort_batch() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_series(&root.path().join("a_good"), &[("0.dcm", 0.0), ("1.dcm", 1.0)], 2, 2);
    write_series(&root.path().join("b_duplicate"), &[("0.dcm", 3.0), ("1.dcm", 3.0)], 2, 2);
    std::fs::create_dir_all(root.path().join("c_empty")).unwrap();
    std::fs::write(root.path().join("c_empty").join("notes.txt"), b"no images here").unwrap();
    write_series(&root.path().join("d_good"), &[("0.dcm", 0.0), ("1.dcm", 1.0)], 2, 2);

    let report = convert::convert_all(root.path(), out.path(), &options(false)).unwrap();

    assert_eq!(
        report.converted,
        vec![out.path().join("a_good.nii.gz"), out.path().join("d_good.nii.gz")]
    );
    let failed: Vec<_> = report.failed.iter().map(|f| f.folder.clone()).collect();
    assert_eq!(failed, vec![root.path().join("b_duplicate"), root.path().join("c_empty")]);
    assert!(!out.path().join("b_duplicate.nii.gz").exists());
}

#[test]
fn test_fail_first_aborts() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_series(&root.path().join("a_duplicate"), &[("0.dcm", 3.0), ("1.dcm", 3.0)], 2, 2);
    write_series(&root.path().join("b_good"), &[("0.dcm", 0.0), ("1.dcm", 1.0)], 2, 2);

    let options = ConversionOptions {
        fail_first: true,
        ..options(false)
    };
    let err = convert::convert_all(root.path(), out.path(), &options).unwrap_err();
    match err {
        convert::Error::Series { source, .. } => {
            assert!(matches!(source, SeriesError::DuplicateSlice { .. }), "{}", source)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!out.path().join("b_good.nii.gz").exists());
}

#[test]
fn test_uneven_increment_fails_strict_and_passes_relaxed() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_series(
        &root.path().join("uneven"),
        &[("0.dcm", 0.0), ("1.dcm", 2.0), ("2.dcm", 4.5)],
        2,
        2,
    );

    let strict = convert::convert_all(root.path(), out.path(), &options(false)).unwrap();
    assert!(strict.converted.is_empty());
    assert_eq!(strict.failed.len(), 1);
    assert!(strict.failed[0].reason.contains("increment"), "{}", strict.failed[0].reason);

    let relaxed = convert::convert_selected(root.path(), &["uneven"], out.path(), &options(false)).unwrap();
    assert_eq!(relaxed.converted, vec![out.path().join("uneven.nii.gz")]);

    let volume = read_volume(&relaxed.converted[0]).unwrap();
    assert_eq!(volume.shape(), &[2, 2, 3]);
    assert_eq!(volume.geometry.spacing()[2], 2.25);
}

#[test]
fn test_unknown_selected_folder_is_recorded() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let report = convert::convert_selected(root.path(), &["missing"], out.path(), &options(false)).unwrap();
    assert!(report.converted.is_empty());
    assert_eq!(report.failed[0].folder, root.path().join("missing"));
}

#[test]
fn test_multi_frame_instance_frames_become_slices() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let series = root.path().join("mf");
    std::fs::create_dir_all(&series).unwrap();

    let pixels = (0..3)
        .flat_map(|f| (0..2).flat_map(move |r| (0..4).map(move |c| pixel(f, r, c))))
        .collect();
    CtInstance {
        sop_instance_uid: "1.2.826.0.1.3680043.2.1125.2",
        rows: 2,
        columns: 4,
        frames: 3,
        position: Some([10.0, 20.0, 30.0]),
        spacing_between_slices: Some(1.5),
        rescale_intercept: Some(-1024.0),
        pixels,
    }
    .write(&series.join("volume.dcm"));

    let report = convert::convert_all(root.path(), out.path(), &options(false)).unwrap();
    assert!(report.failed.is_empty(), "{:?}", report.failed);

    let volume = read_volume(&report.converted[0]).unwrap();
    assert_eq!(volume.shape(), &[4, 2, 3]);
    assert_eq!(volume.data[[3, 1, 2]], pixel(2, 1, 3) as f64 - 1024.0);
    assert_eq!(volume.geometry.spacing()[2], 1.5);
    assert_eq!(volume.geometry.affine()[2][3], 30.0);
}
