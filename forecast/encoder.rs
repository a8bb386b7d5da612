//! Bijection between entity names and dense integer codes.
//!
//! The encoder is fitted once on the full dataset's entity set, so every
//! entity that may appear at prediction time has a code, including entities
//! whose rows all landed in the held-out split. Classes are kept sorted and
//! `code == index`, which makes the mapping reproducible from the class list
//! alone.

use crate::artifact::{self, ArtifactError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Entity '{0}' was not seen when the encoder was fitted.")]
    UnknownCategory(String),
    #[error("Code {code} is outside the encoder range 0..{len}.")]
    UnknownCode { code: usize, len: usize },
    #[error("Encoder artifact is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEncoder {
    classes: Vec<String>,
}

impl EntityEncoder {
    /// Fits the encoder on every name yielded, duplicates collapsed.
    pub fn fit<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let classes: BTreeSet<&str> = names.into_iter().collect();
        Self {
            classes: classes.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn encode(&self, name: &str) -> Result<usize, EncoderError> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(name))
            .map_err(|_| EncoderError::UnknownCategory(name.to_string()))
    }

    pub fn decode(&self, code: usize) -> Result<&str, EncoderError> {
        self.classes
            .get(code)
            .map(String::as_str)
            .ok_or(EncoderError::UnknownCode {
                code,
                len: self.classes.len(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.encode(name).is_ok()
    }

    /// Sorted class names.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<(), EncoderError> {
        artifact::save_toml(self, path)?;
        log::info!(
            "Saved encoder with {} classes to {}",
            self.classes.len(),
            path.display()
        );
        Ok(())
    }

    /// Loads an encoder artifact and checks that its classes are sorted and
    /// distinct.
    pub fn load(path: &Path) -> Result<Self, EncoderError> {
        let encoder: EntityEncoder = artifact::load_toml(path)?;
        if let Some(pair) = encoder.classes.windows(2).find(|w| w[0] >= w[1]) {
            return Err(EncoderError::Corrupt(format!(
                "classes are not strictly sorted near '{}' and '{}'",
                pair[0], pair[1]
            )));
        }
        Ok(encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn encoder() -> EntityEncoder {
        EntityEncoder::fit(["Peru", "Chile", "Argentina", "Chile", "Peru"])
    }

    #[test]
    fn classes_are_sorted_and_distinct() {
        assert_eq!(encoder().classes(), ["Argentina", "Chile", "Peru"]);
        assert_eq!(encoder().len(), 3);
    }

    #[test]
    fn encode_decode_is_a_bijection() {
        let enc = encoder();
        for (code, name) in enc.classes().iter().enumerate() {
            assert_eq!(enc.encode(name).unwrap(), code);
            assert_eq!(enc.decode(code).unwrap(), name);
        }
    }

    #[test]
    fn unknown_values_are_errors() {
        let enc = encoder();
        assert!(matches!(
            enc.encode("Atlantis"),
            Err(EncoderError::UnknownCategory(name)) if name == "Atlantis"
        ));
        assert!(matches!(
            enc.decode(3),
            Err(EncoderError::UnknownCode { code: 3, len: 3 })
        ));
        assert!(!enc.contains("chile"));
        assert!(enc.contains("Chile"));
    }

    #[test]
    fn artifact_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encoder.toml");
        let enc = encoder();
        enc.save(&path).unwrap();
        assert_eq!(EntityEncoder::load(&path).unwrap(), enc);
    }

    #[test]
    fn unsorted_artifact_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encoder.toml");
        std::fs::write(&path, "classes = [\"Peru\", \"Chile\"]\n").unwrap();
        assert!(matches!(
            EntityEncoder::load(&path),
            Err(EncoderError::Corrupt(_))
        ));
    }
}
