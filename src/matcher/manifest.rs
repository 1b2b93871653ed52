use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_HEADER: &str = "case_id | image_path | mask_paths";
pub const NO_MASKS: &str = "NONE";

/// One manifest line: `case_id | image | masks` with masks joined by `", "`,
/// or `NONE` when the case has no masks.
pub fn format_row(case_id: &str, image: &Path, masks: &[PathBuf]) -> String {
    let masks = if masks.is_empty() {
        NO_MASKS.to_string()
    } else {
        masks
            .iter()
            .map(|m| m.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("{} | {} | {}", case_id, image.display(), masks)
}

/// Plain-text audit trail mapping case ids back to their sources.
pub struct ManifestWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ManifestWriter {
    /// Truncate or create the manifest and write its header line.
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", MANIFEST_HEADER)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn record(&mut self, case_id: &str, image: &Path, masks: &[PathBuf]) -> io::Result<()> {
        writeln!(self.writer, "{}", format_row(case_id, image, masks))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }
}
