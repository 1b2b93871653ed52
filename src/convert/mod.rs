//! Batch conversion of DICOM series folders to volume files.
//!
//! A failing series is logged and recorded and the batch moves on, unless
//! `fail_first` is set.

use std::path::{Path, PathBuf};

use snafu::prelude::*;
use snafu::Report;
use tracing::{error, info};

use crate::config::DEFAULT_FILE_ENDING;
use crate::utils::{file_name_string, list_subdirectories, maybe_mkdir, progress_bar};

pub mod series;

pub use series::{convert_series, read_series, SeriesError, SeriesOptions};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not list series folders in {}", path.display()))]
    ListSeries {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not create output folder {}", path.display()))]
    CreateOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Conversion of {} failed", folder.display()))]
    Series {
        folder: PathBuf,
        source: SeriesError,
    },

    #[snafu(display("{} is not a series folder", folder.display()))]
    MissingFolder { folder: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub series: SeriesOptions,
    /// Abort on the first failing series
    pub fail_first: bool,
    pub file_ending: String,
    pub verbose: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            series: SeriesOptions::default(),
            fail_first: false,
            file_ending: DEFAULT_FILE_ENDING.to_string(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSeries {
    pub folder: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub converted: Vec<PathBuf>,
    pub failed: Vec<FailedSeries>,
}

/// Convert every immediate subfolder of `dicom_root` to
/// `<output_dir>/<folder><ending>`.
pub fn convert_all(dicom_root: &Path, output_dir: &Path, options: &ConversionOptions) -> Result<ConversionReport, Error> {
    let folders = list_subdirectories(dicom_root).context(ListSeriesSnafu { path: dicom_root })?;
    info!("{} series folders in {}", folders.len(), dicom_root.display());
    convert_folders(&folders, output_dir, options)
}

/// Re-attempt the named series folders with the slice increment check
/// turned off.
pub fn convert_selected<S: AsRef<str>>(
    dicom_root: &Path,
    folders: &[S],
    output_dir: &Path,
    options: &ConversionOptions,
) -> Result<ConversionReport, Error> {
    let mut options = options.clone();
    options.series.validate_slice_increment = false;

    let folders: Vec<PathBuf> = folders.iter().map(|f| dicom_root.join(f.as_ref())).collect();
    convert_folders(&folders, output_dir, &options)
}

fn convert_folders(folders: &[PathBuf], output_dir: &Path, options: &ConversionOptions) -> Result<ConversionReport, Error> {
    maybe_mkdir(output_dir).context(CreateOutputSnafu { path: output_dir })?;

    let mut report = ConversionReport::default();
    let bar = progress_bar(folders.len(), options.verbose);

    for folder in folders {
        let name = file_name_string(folder);
        if let Some(bar) = bar.as_ref() {
            bar.set_message(name.clone());
        }

        let result = if folder.is_dir() {
            let output = output_dir.join(format!("{}{}", name, options.file_ending));
            convert_series(folder, &output, &options.series)
                .map(|_| output)
                .context(SeriesSnafu { folder })
        } else {
            MissingFolderSnafu { folder }.fail()
        };

        match result {
            Ok(output) => {
                info!("Converted {} to {}", folder.display(), output.display());
                report.converted.push(output);
            }
            Err(e) if options.fail_first => return Err(e),
            Err(e) => {
                let reason = Report::from_error(&e).to_string();
                error!("{}", reason);
                report.failed.push(FailedSeries {
                    folder: folder.clone(),
                    reason,
                });
            }
        }

        if let Some(bar) = bar.as_ref() {
            bar.inc(1);
        }
    }

    if let Some(bar) = bar {
        bar.finish_with_message("done");
    }
    Ok(report)
}
