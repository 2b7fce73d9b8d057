//! Project document handed in by the project editor when a burn starts.
//!
//! The orchestrator treats it as an opaque payload and forwards it to the
//! backend untouched.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub name: String,
    pub volume_id: String,
    pub entries: Vec<FileEntry>,
    pub iso_options: IsoOptions,
    pub burn_options: BurnOptions,
}

impl Project {
    /// Sum of the sizes of all file entries, recursing into directories.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(FileEntry::total_size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileEntry {
    pub source_path: String,
    pub dest_path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileEntry>,
}

impl FileEntry {
    fn total_size(&self) -> u64 {
        if self.is_dir && !self.children.is_empty() {
            self.children.iter().map(FileEntry::total_size).sum()
        } else {
            self.size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IsoOptions {
    pub rock_ridge: bool,
    pub joliet: bool,
    pub md5: bool,
    pub backup_mode: bool,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            rock_ridge: true,
            joliet: true,
            md5: true,
            backup_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurnOptions {
    /// `auto` or an engine speed value.
    pub speed: String,
    pub dummy_mode: bool,
    pub verify: bool,
    pub close_disc: bool,
    pub stream_recording: bool,
    pub eject: bool,
    /// Padding in KiB appended after the image.
    pub padding: u32,
}

impl Default for BurnOptions {
    fn default() -> Self {
        Self {
            speed: "auto".to_string(),
            dummy_mode: false,
            verify: true,
            close_disc: false,
            stream_recording: false,
            eject: true,
            padding: 300,
        }
    }
}

impl BurnOptions {
    /// Whether a read-back pass follows the write. A dummy burn leaves
    /// nothing to read.
    pub fn verifies(&self) -> bool {
        self.verify && !self.dummy_mode
    }
}
