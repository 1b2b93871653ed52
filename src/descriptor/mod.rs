//! `dataset.json` emission for the training framework.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use snafu::prelude::*;
use tracing::info;

use crate::config::DatasetConfig;
use crate::utils::list_files_with_ending;

pub const DESCRIPTOR_FILE_NAME: &str = "dataset.json";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Label map must map 'background' to 0"))]
    MissingBackground,

    #[snafu(display("Could not serialize dataset descriptor"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Could not write {}", path.display()))]
    WriteDescriptor {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not count training labels in {}", path.display()))]
    CountLabels {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Label names to integer values, serialized in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap(Vec<(String, u8)>);

impl LabelMap {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, u8)>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `background = 0, lesion = 1`
    pub fn lesions() -> Self {
        Self::new([("background", 0), ("lesion", 1)])
    }

    pub fn get(&self, name: &str) -> Option<u8> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
    }
}

impl Serialize for LabelMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Contents of `dataset.json`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetDescriptor {
    pub channel_names: BTreeMap<String, String>,
    pub labels: LabelMap,
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    pub file_ending: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub licence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_by: Option<String>,
}

impl DatasetDescriptor {
    /// Single CT channel, background/lesion labels.
    pub fn lesions(config: &DatasetConfig, num_training: usize) -> Self {
        Self {
            channel_names: BTreeMap::from([("0".to_string(), "CT".to_string())]),
            labels: LabelMap::lesions(),
            num_training,
            file_ending: config.file_ending.clone(),
            name: config.task_name.clone(),
            description: None,
            reference: None,
            release: None,
            licence: None,
            converted_by: None,
        }
    }
}

/// Write `dataset.json` into `output_folder` and return its path.
pub fn generate_dataset_json(output_folder: &Path, descriptor: &DatasetDescriptor) -> Result<PathBuf, Error> {
    ensure!(descriptor.labels.get("background") == Some(0), MissingBackgroundSnafu);

    let json = serde_json::to_string_pretty(descriptor).context(SerializeSnafu)?;
    let path = output_folder.join(DESCRIPTOR_FILE_NAME);
    std::fs::create_dir_all(output_folder).context(WriteDescriptorSnafu { path: &path })?;
    std::fs::write(&path, json).context(WriteDescriptorSnafu { path: &path })?;

    info!("Wrote {} ({} training cases)", path.display(), descriptor.num_training);
    Ok(path)
}

/// Number of label files in `labels_dir`, for emitting a descriptor without
/// re-running the matcher.
pub fn count_training_cases(labels_dir: &Path, file_ending: &str) -> Result<usize, Error> {
    let labels = list_files_with_ending(labels_dir, file_ending)
        .context(CountLabelsSnafu { path: labels_dir })?;
    Ok(labels.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json_layout() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = DatasetDescriptor::lesions(&DatasetConfig::default(), 7);
        let path = generate_dataset_json(dir.path(), &descriptor).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["channel_names"]["0"], "CT");
        assert_eq!(value["labels"]["background"], 0);
        assert_eq!(value["labels"]["lesion"], 1);
        assert_eq!(value["numTraining"], 7);
        assert_eq!(value["file_ending"], ".nii.gz");
        assert_eq!(value["name"], "Lesions");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_labels_keep_insertion_order() {
        let labels = LabelMap::new([("background", 0), ("zeta", 1), ("alpha", 2)]);
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"background":0,"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn test_missing_background_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = DatasetDescriptor::lesions(&DatasetConfig::default(), 1);
        descriptor.labels = LabelMap::new([("lesion", 1)]);
        let err = generate_dataset_json(dir.path(), &descriptor).unwrap_err();
        assert!(matches!(err, Error::MissingBackground));
    }

    #[test]
    fn test_count_training_cases() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["case_000001.nii.gz", "case_000002.nii.gz", "readme.md"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(count_training_cases(dir.path(), ".nii.gz").unwrap(), 2);
    }
}
