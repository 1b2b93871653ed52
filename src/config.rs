use std::path::{Path, PathBuf};

/// Default dataset identifier of the produced training dataset
pub const DEFAULT_DATASET_ID: u16 = 750;
/// Default task name, also used as the dataset name in `dataset.json`
pub const DEFAULT_TASK_NAME: &str = "Lesions";
/// File ending shared by every volume the pipeline reads or writes
pub const DEFAULT_FILE_ENDING: &str = ".nii.gz";
/// Channel suffix appended to image case identifiers (single CT channel)
pub const DEFAULT_CHANNEL_SUFFIX: &str = "0000";
/// Marker that separates the case key from the rest of a mask filename
pub const DEFAULT_MASK_MARKER: &str = "_segmentation";

/// Folder where raw resources land when acquired with the raw strategy
pub const DEFAULT_RESOURCES_DIR: &str = "./download_resources";
/// Folder where segmentation masks land
pub const DEFAULT_MASKS_DIR: &str = "./download_masks";
/// Folder holding one volume per case, ready for matching
pub const DEFAULT_IMAGES_DIR: &str = "./nifti_resources";

/// Naming conventions of the produced dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetConfig {
    pub dataset_id: u16,
    pub task_name: String,
    /// e.g. ".nii.gz"
    pub file_ending: String,
    pub channel_suffix: String,
    pub mask_marker: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_id: DEFAULT_DATASET_ID,
            task_name: DEFAULT_TASK_NAME.to_string(),
            file_ending: DEFAULT_FILE_ENDING.to_string(),
            channel_suffix: DEFAULT_CHANNEL_SUFFIX.to_string(),
            mask_marker: DEFAULT_MASK_MARKER.to_string(),
        }
    }
}

impl DatasetConfig {
    /// `Dataset{id}_{task}`, the folder created under the output base
    pub fn folder_name(&self) -> String {
        format!("Dataset{}_{}", self.dataset_id, self.task_name)
    }

    pub fn manifest_file_name(&self) -> String {
        format!("{}_mapping.txt", self.folder_name())
    }

    pub fn layout(&self, output_base: &Path) -> DatasetLayout {
        DatasetLayout::new(output_base.join(self.folder_name()))
    }

    /// Image file name for a case, e.g. `case_000001_0000.nii.gz`
    pub fn image_file_name(&self, case_id: &str) -> String {
        format!("{}_{}{}", case_id, self.channel_suffix, self.file_ending)
    }

    /// Label file name for a case, e.g. `case_000001.nii.gz`
    pub fn label_file_name(&self, case_id: &str) -> String {
        format!("{}{}", case_id, self.file_ending)
    }
}

/// Folders of a dataset in the training framework's raw layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub images_tr: PathBuf,
    pub labels_tr: PathBuf,
    pub images_ts: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: PathBuf) -> Self {
        Self {
            images_tr: root.join("imagesTr"),
            labels_tr: root.join("labelsTr"),
            images_ts: root.join("imagesTs"),
            root,
        }
    }

    pub fn create(&self) -> std::io::Result<()> {
        for dir in [&self.images_tr, &self.labels_tr, &self.images_ts] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Zero-padded case identifier, counting from 1.
pub fn case_id(counter: usize) -> String {
    format!("case_{:06}", counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_and_file_names() {
        let config = DatasetConfig::default();
        assert_eq!(config.folder_name(), "Dataset750_Lesions");
        assert_eq!(config.manifest_file_name(), "Dataset750_Lesions_mapping.txt");
        assert_eq!(config.image_file_name("case_000001"), "case_000001_0000.nii.gz");
        assert_eq!(config.label_file_name("case_000001"), "case_000001.nii.gz");
    }

    #[test]
    fn test_case_id_padding() {
        assert_eq!(case_id(1), "case_000001");
        assert_eq!(case_id(123456), "case_123456");
    }

    #[test]
    fn test_layout() {
        let layout = DatasetConfig::default().layout(Path::new("/data/raw"));
        assert_eq!(layout.root, PathBuf::from("/data/raw/Dataset750_Lesions"));
        assert_eq!(layout.labels_tr, PathBuf::from("/data/raw/Dataset750_Lesions/labelsTr"));
    }
}
