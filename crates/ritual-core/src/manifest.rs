//! Record of a written plan, kept in the output folder.
//!
//! A second run with the same plan and options finds the manifest, sees every
//! recorded file in place and writes nothing.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::naming::OutputAssignment;
use crate::transcode::CompressionPreset;

/// Current manifest file format version
const MANIFEST_VERSION: u32 = 1;

pub const MANIFEST_FILENAME: &str = ".ritual-plan.json";
const MANIFEST_TEMP_FILENAME: &str = ".ritual-plan.tmp";

/// One file written to the output folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source: PathBuf,
    /// File name inside the output folder
    pub output: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
    pub groups: usize,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(digest: String, groups: usize, entries: Vec<ManifestEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            timestamp: Utc::now(),
            digest,
            groups,
            entries,
        }
    }

    /// Load the manifest from an output folder, if there is one.
    pub fn load(output_dir: &Path) -> Result<Option<Self>> {
        let path = output_dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// Write to a temp file first, then rename over the old manifest.
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        let path = output_dir.join(MANIFEST_FILENAME);
        let temp_path = output_dir.join(MANIFEST_TEMP_FILENAME);

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// `true` if this manifest describes `digest` and every recorded file is
    /// still present with its recorded size.
    pub fn is_applied(&self, output_dir: &Path, digest: &str) -> bool {
        self.version == MANIFEST_VERSION
            && self.digest == digest
            && self.entries.iter().all(|e| {
                fs::metadata(output_dir.join(&e.output))
                    .map(|m| m.is_file() && m.len() == e.size)
                    .unwrap_or(false)
            })
    }

    /// Output names this manifest accounts for.
    pub fn outputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.output.as_str())
    }
}

/// Digest of everything that decides what a write produces: each source
/// with its size and target name, and the post-pass settings.
pub fn plan_digest(assignment: &OutputAssignment, compress: Option<CompressionPreset>, split_segments: u8) -> String {
    let mut hasher = Sha256::new();
    for entry in &assignment.entries {
        hasher.update(entry.source.to_string_lossy().as_bytes());
        hasher.update([0]);
        let size = fs::metadata(&entry.source).map(|m| m.len()).unwrap_or(0);
        hasher.update(size.to_le_bytes());
        hasher.update(entry.file_name.as_bytes());
        hasher.update(b"\n");
    }
    let compress = compress.map(|p| format!("{p:?}")).unwrap_or_default();
    hasher.update(compress.as_bytes());
    hasher.update([split_segments]);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::naming::OutputEntry;
    use tempfile::tempdir;

    fn assignment(names: &[(&str, &str)]) -> OutputAssignment {
        OutputAssignment {
            entries: names
                .iter()
                .map(|(source, name)| OutputEntry {
                    source: PathBuf::from(source),
                    file_name: name.to_string(),
                    group_index: 0,
                    kind: MediaKind::Photo,
                    capture_timestamp: None,
                })
                .collect(),
            fallbacks: vec![],
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        assert!(Manifest::load(dir.path()).unwrap().is_none());

        let manifest = Manifest::new(
            "abc".into(),
            1,
            vec![ManifestEntry {
                source: PathBuf::from("/in/a.jpg"),
                output: "001.jpg".into(),
                size: 3,
            }],
        );
        manifest.save(dir.path()).unwrap();
        assert!(!dir.path().join(MANIFEST_TEMP_FILENAME).exists());

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.digest, "abc");
        assert_eq!(loaded.outputs().collect::<Vec<_>>(), vec!["001.jpg"]);
    }

    #[test]
    fn test_is_applied_checks_files() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::new(
            "abc".into(),
            1,
            vec![ManifestEntry {
                source: PathBuf::from("/in/a.jpg"),
                output: "001.jpg".into(),
                size: 3,
            }],
        );
        assert!(!manifest.is_applied(dir.path(), "abc"));

        fs::write(dir.path().join("001.jpg"), b"abc").unwrap();
        assert!(manifest.is_applied(dir.path(), "abc"));
        assert!(!manifest.is_applied(dir.path(), "other"));

        fs::write(dir.path().join("001.jpg"), b"abcd").unwrap();
        assert!(!manifest.is_applied(dir.path(), "abc"));
    }

    #[test]
    fn test_digest_tracks_names_and_options() {
        let a = assignment(&[("/in/a.jpg", "001.jpg")]);
        let b = assignment(&[("/in/a.jpg", "002.jpg")]);
        assert_eq!(plan_digest(&a, None, 1), plan_digest(&a, None, 1));
        assert_ne!(plan_digest(&a, None, 1), plan_digest(&b, None, 1));
        assert_ne!(plan_digest(&a, None, 1), plan_digest(&a, Some(CompressionPreset::Small), 1));
        assert_ne!(plan_digest(&a, None, 1), plan_digest(&a, None, 3));
    }
}
