//! On-disk persistence shared by the model and encoder artifacts.
//!
//! Artifacts are TOML. Every write goes to a sibling `<name>.tmp` file first and
//! is renamed into place only after the bytes are flushed and synced, so a
//! reader never observes a half-written artifact.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse TOML artifact '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize artifact to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Serializes `value` to TOML and writes it atomically to `path`.
pub fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let text = toml::to_string(value)?;
    write_atomic(path, text.as_bytes())
}

/// Reads and deserializes a TOML artifact.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let text = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ArtifactError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `bytes` to `path` through a temporary sibling file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let io_error = |source: io::Error| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let temp_path = temp_path_for(path);
    if let Err(e) = write_synced(&temp_path, bytes) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_error(e));
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_error(e));
    }

    log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "artifact".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<f64>,
    }

    #[test]
    fn save_then_load_preserves_values_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.toml");
        let original = Sample {
            name: "growth".to_string(),
            values: vec![0.1, -2.75, 1.0 / 3.0],
        };

        save_toml(&original, &path).unwrap();
        let loaded: Sample = load_toml(&path).unwrap();
        assert_eq!(loaded, original);
        assert!(!dir.path().join("sample.toml.tmp").exists());
    }

    #[test]
    fn write_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.toml");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn write_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("a.toml");
        write_atomic(&path, b"x = 1").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn failed_write_leaves_no_partial_files() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("model.toml");

        let err = write_atomic(&path, b"data").unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
        assert!(!path.exists());
        assert!(!blocker.join("model.toml.tmp").exists());
    }

    #[test]
    fn load_reports_parse_failures_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "name = [unterminated").unwrap();
        match load_toml::<Sample>(&path) {
            Err(ArtifactError::TomlParse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("Expected TomlParse error, got {other:?}"),
        }
    }
}
