//! Classification of uploaded files by name.

use crate::error::{CumulusError, Result};
use crate::keys::SEPARATOR;
use serde::{Deserialize, Serialize};

/// What an uploaded child file is, decided from its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    /// `*.cube.parquet`
    Cube,
    /// `*.annotated_cube.parquet`
    AnnotatedCube,
    /// `*.flat.parquet`
    Flat,
    /// `*.meta.parquet` and the discovery/catalog study exports
    Meta,
    /// `*.archive.parquet`, line-level detail that is never kept
    Archive,
    /// Any other parquet; processed as counts
    OtherParquet,
    NotParquet,
}

impl FileCategory {
    /// Classify a key or bare filename.
    pub fn classify(name: &str) -> Self {
        // Bare filenames are matched as if they sat under a folder.
        let path = if name.contains('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };

        if path.ends_with(".archive.parquet") {
            FileCategory::Archive
        } else if path.ends_with(".meta.parquet")
            || path.contains("/discovery__")
            || path.contains("/catalog__")
            || path.contains("__meta_")
        {
            FileCategory::Meta
        } else if path.ends_with(".flat.parquet") {
            FileCategory::Flat
        } else if path.ends_with(".annotated_cube.parquet") {
            FileCategory::AnnotatedCube
        } else if path.ends_with(".cube.parquet") {
            FileCategory::Cube
        } else if path.ends_with(".parquet") {
            FileCategory::OtherParquet
        } else {
            FileCategory::NotParquet
        }
    }

    /// Whether the file produces a cross-site aggregate.
    pub fn is_counts(self) -> bool {
        matches!(
            self,
            FileCategory::Cube | FileCategory::AnnotatedCube | FileCategory::OtherParquet
        )
    }
}

/// Data package named by an uploaded filename: the text between `<study>__`
/// and the first `.`.
pub fn data_package_from_filename(study: &str, filename: &str) -> Result<String> {
    let malformed = || {
        CumulusError::MalformedKey(format!(
            "{filename}: expected a '{study}{SEPARATOR}<name>.' prefix"
        ))
    };
    let rest = filename
        .strip_prefix(study)
        .and_then(|r| r.strip_prefix(SEPARATOR))
        .ok_or_else(malformed)?;
    let name = rest.split('.').next().unwrap_or_default();
    if name.is_empty() {
        return Err(malformed());
    }
    Ok(name.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(FileCategory::classify("s__a.archive.parquet"), FileCategory::Archive);
        assert_eq!(FileCategory::classify("s__a.meta.parquet"), FileCategory::Meta);
        assert_eq!(FileCategory::classify("discovery__code.cube.parquet"), FileCategory::Meta);
        assert_eq!(
            FileCategory::classify("upload/catalog/x/site/099/catalog__y.parquet"),
            FileCategory::Meta
        );
        assert_eq!(FileCategory::classify("s__meta_date.parquet"), FileCategory::Meta);
        assert_eq!(FileCategory::classify("s__a.flat.parquet"), FileCategory::Flat);
        assert_eq!(
            FileCategory::classify("s__a.annotated_cube.parquet"),
            FileCategory::AnnotatedCube
        );
        assert_eq!(FileCategory::classify("s__a.cube.parquet"), FileCategory::Cube);
        assert_eq!(FileCategory::classify("s__a.parquet"), FileCategory::OtherParquet);
        assert_eq!(FileCategory::classify("s__a.csv"), FileCategory::NotParquet);
        // a study merely containing the word is not a discovery export
        assert_eq!(FileCategory::classify("mydiscovery__a.cube.parquet"), FileCategory::Cube);
    }

    #[test]
    fn test_data_package_from_filename() {
        assert_eq!(
            data_package_from_filename("study_new", "study_new__patients.cube.parquet").unwrap(),
            "patients"
        );
        assert_eq!(
            data_package_from_filename("core", "core__count_encounter.flat.parquet").unwrap(),
            "count_encounter"
        );
        assert!(data_package_from_filename("core", "other__x.cube.parquet").is_err());
        assert!(data_package_from_filename("core", "core__.cube.parquet").is_err());
    }
}
