//! Object-store key algebra.
//!
//! Every artifact in the bucket lives at a key that is a pure function of its
//! subbucket and a [`PackageMetadata`] tuple:
//!
//! | Subbucket | Layout |
//! |---|---|
//! | `upload_staging` | `upload_staging/<study>/<site>/<version>/<filename>` |
//! | `upload` | `upload/<study>/<dp>/<site>/<version>/<filename>` |
//! | `latest`, `last_valid`, `error`, `study_metadata` | `<sub>/<study>/<study>__<dp>/<site>/<version>/<filename>` |
//! | `aggregates` | `aggregates/<study>/<study>__<dp>/<study>__<dp>__<version>/<filename>` |
//! | `flat` | `flat/<study>/<site>/<study>__<dp>__<site>__<version>/<filename>` |
//! | `archive` | `archive/<study>/<site>/<version>/<timestamp>/<filename>` |
//!
//! [`encode`] and [`decode`] are inverse on valid tuples; anything else is a
//! [`CumulusError::MalformedKey`].

use crate::error::{CumulusError, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved component separator.
pub const SEPARATOR: &str = "__";

/// Top-level partition of the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subbucket {
    UploadStaging,
    Upload,
    Latest,
    LastValid,
    Aggregates,
    Flat,
    Archive,
    StudyMetadata,
    Metadata,
    Cache,
    Error,
    Admin,
    Static,
}

impl Subbucket {
    pub const ALL: [Subbucket; 13] = [
        Subbucket::UploadStaging,
        Subbucket::Upload,
        Subbucket::Latest,
        Subbucket::LastValid,
        Subbucket::Aggregates,
        Subbucket::Flat,
        Subbucket::Archive,
        Subbucket::StudyMetadata,
        Subbucket::Metadata,
        Subbucket::Cache,
        Subbucket::Error,
        Subbucket::Admin,
        Subbucket::Static,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subbucket::UploadStaging => "upload_staging",
            Subbucket::Upload => "upload",
            Subbucket::Latest => "latest",
            Subbucket::LastValid => "last_valid",
            Subbucket::Aggregates => "aggregates",
            Subbucket::Flat => "flat",
            Subbucket::Archive => "archive",
            Subbucket::StudyMetadata => "study_metadata",
            Subbucket::Metadata => "metadata",
            Subbucket::Cache => "cache",
            Subbucket::Error => "error",
            Subbucket::Admin => "admin",
            Subbucket::Static => "static",
        }
    }

    /// Subbuckets laid out as `<sub>/<study>/<study>__<dp>/<site>/<version>/`.
    fn is_site_scoped(self) -> bool {
        matches!(
            self,
            Subbucket::Latest | Subbucket::LastValid | Subbucket::Error | Subbucket::StudyMetadata
        )
    }

    /// Top-level prefix including the trailing slash.
    pub fn prefix(self) -> String {
        format!("{}/", self.as_str())
    }
}

impl fmt::Display for Subbucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subbucket {
    type Err = CumulusError;

    fn from_str(s: &str) -> Result<Self> {
        Subbucket::ALL
            .into_iter()
            .find(|sub| sub.as_str() == s)
            .ok_or_else(|| CumulusError::MalformedKey(format!("unknown subbucket '{s}'")))
    }
}

/// Identity of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub study: String,
    pub data_package: Option<String>,
    pub site: Option<String>,
    pub version: String,
    pub filename: Option<String>,
}

impl PackageMetadata {
    pub fn new(study: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            study: study.into(),
            data_package: None,
            site: None,
            version: version.into(),
            filename: None,
        }
    }

    /// The cross-site aggregate of a data package, with its canonical filename.
    pub fn aggregate(study: &str, data_package: &str, version: &str) -> Self {
        Self::new(study, version)
            .with_data_package(data_package)
            .with_filename(format!("{study}{SEPARATOR}{data_package}{SEPARATOR}aggregate.parquet"))
    }

    /// A site's flat result, with its canonical filename.
    pub fn flat(study: &str, data_package: &str, site: &str, version: &str) -> Self {
        Self::new(study, version)
            .with_data_package(data_package)
            .with_site(site)
            .with_filename(format!(
                "{study}{SEPARATOR}{data_package}{SEPARATOR}{site}{SEPARATOR}flat.parquet"
            ))
    }

    pub fn with_data_package(mut self, data_package: impl Into<String>) -> Self {
        self.data_package = Some(data_package.into());
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn data_package(&self) -> Result<&str> {
        self.data_package
            .as_deref()
            .ok_or_else(|| CumulusError::MalformedKey(format!("{} has no data package", self.study)))
    }

    pub fn site(&self) -> Result<&str> {
        self.site
            .as_deref()
            .ok_or_else(|| CumulusError::MalformedKey(format!("{} has no site", self.study)))
    }

    pub fn filename(&self) -> Result<&str> {
        self.filename
            .as_deref()
            .ok_or_else(|| CumulusError::MalformedKey(format!("{} has no filename", self.study)))
    }

    /// `study__dp`
    pub fn qualified_package(&self) -> Result<String> {
        Ok(format!("{}{SEPARATOR}{}", self.study, self.data_package()?))
    }

    /// Catalog id of the cube: `study__dp__version`.
    pub fn package_id(&self) -> Result<String> {
        Ok(format!("{}{SEPARATOR}{}", self.qualified_package()?, self.version))
    }

    /// Catalog id of the site's flat table: `study__dp__site__version`.
    pub fn flat_package_id(&self) -> Result<String> {
        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.qualified_package()?,
            self.site()?,
            self.version
        ))
    }

    /// Parse a catalog id back into its components.
    ///
    /// Three components name a cube, four a flat table.
    pub fn from_package_id(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split(SEPARATOR).collect();
        let meta = match parts.as_slice() {
            [study, dp, version] => Self::new(*study, *version).with_data_package(*dp),
            [study, dp, site, version] => Self::new(*study, *version)
                .with_data_package(*dp)
                .with_site(*site),
            _ => return Err(malformed(id, "not a package id")),
        };
        validate_identifier(&meta.study, id)?;
        validate_identifier(meta.data_package()?, id)?;
        if let Some(site) = &meta.site {
            validate_site(site, id)?;
        }
        validate_version(&meta.version, id)?;
        Ok(meta)
    }
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub subbucket: Subbucket,
    pub meta: PackageMetadata,
    /// Archive timestamp folder, only for `archive/` keys.
    pub archived_at: Option<String>,
}

fn malformed(key: &str, reason: &str) -> CumulusError {
    CumulusError::MalformedKey(format!("{key}: {reason}"))
}

fn validate_identifier(value: &str, key: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !value.contains(SEPARATOR)
        && !value.starts_with('_')
        && !value.ends_with('_');
    if ok {
        Ok(())
    } else {
        Err(malformed(key, &format!("invalid identifier '{value}'")))
    }
}

fn validate_site(value: &str, key: &str) -> Result<()> {
    let ok = !value.is_empty()
        && !value.contains('/')
        && !value.contains(SEPARATOR)
        && !value.starts_with('_')
        && !value.ends_with('_');
    if ok {
        Ok(())
    } else {
        Err(malformed(key, &format!("invalid site '{value}'")))
    }
}

fn validate_version(value: &str, key: &str) -> Result<()> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(malformed(key, &format!("invalid version '{value}'")))
    }
}

fn validate_filename(value: &str, key: &str) -> Result<()> {
    if !value.is_empty() && !value.contains('/') {
        Ok(())
    } else {
        Err(malformed(key, &format!("invalid filename '{value}'")))
    }
}

fn validate_timestamp(value: &str, key: &str) -> Result<()> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|_| malformed(key, &format!("invalid archive timestamp '{value}'")))
}

/// Zero-pad a numeric version to three digits (`99` -> `099`).
pub fn normalize_version(version: &str) -> String {
    format!("{:0>3}", version)
}

/// `<sub>/<study>/<study>__<dp>/`: every site and version of one package.
pub fn package_root(subbucket: Subbucket, study: &str, data_package: &str) -> Result<String> {
    match subbucket {
        s if s.is_site_scoped() || s == Subbucket::Aggregates => Ok(format!(
            "{}/{study}/{study}{SEPARATOR}{data_package}/",
            s.as_str()
        )),
        Subbucket::Upload => Ok(format!("upload/{study}/{data_package}/")),
        other => Err(CumulusError::MalformedKey(format!(
            "{other} is not grouped by data package"
        ))),
    }
}

/// Folder portion of the key (with a trailing slash) for the tuple.
pub fn prefix(subbucket: Subbucket, meta: &PackageMetadata) -> Result<String> {
    let study = &meta.study;
    let version = &meta.version;
    let key = format!("{subbucket}/{study}");
    validate_identifier(study, &key)?;
    validate_version(version, &key)?;

    match subbucket {
        Subbucket::UploadStaging => {
            let site = meta.site()?;
            validate_site(site, &key)?;
            Ok(format!("upload_staging/{study}/{site}/{version}/"))
        }
        Subbucket::Upload => {
            let dp = meta.data_package()?;
            let site = meta.site()?;
            validate_identifier(dp, &key)?;
            validate_site(site, &key)?;
            Ok(format!("upload/{study}/{dp}/{site}/{version}/"))
        }
        s if s.is_site_scoped() => {
            let dp = meta.data_package()?;
            let site = meta.site()?;
            validate_identifier(dp, &key)?;
            validate_site(site, &key)?;
            Ok(format!("{s}/{study}/{study}{SEPARATOR}{dp}/{site}/{version}/"))
        }
        Subbucket::Aggregates => {
            let dp = meta.data_package()?;
            validate_identifier(dp, &key)?;
            if meta.site.is_some() {
                return Err(malformed(&key, "aggregates are not site scoped"));
            }
            let package = format!("{study}{SEPARATOR}{dp}");
            Ok(format!("aggregates/{study}/{package}/{package}{SEPARATOR}{version}/"))
        }
        Subbucket::Flat => {
            let dp = meta.data_package()?;
            let site = meta.site()?;
            validate_identifier(dp, &key)?;
            validate_site(site, &key)?;
            Ok(format!(
                "flat/{study}/{site}/{study}{SEPARATOR}{dp}{SEPARATOR}{site}{SEPARATOR}{version}/"
            ))
        }
        Subbucket::Archive => Err(malformed(&key, "archive keys need a timestamp")),
        other => Err(malformed(&key, &format!("{other} has no package layout"))),
    }
}

/// Encode the full key for the tuple. The filename is required.
pub fn encode(subbucket: Subbucket, meta: &PackageMetadata) -> Result<String> {
    let folder = prefix(subbucket, meta)?;
    let filename = meta.filename()?;
    validate_filename(filename, &folder)?;
    Ok(format!("{folder}{filename}"))
}

/// Encode an `archive/` key; `archived_at` is an RFC 3339 timestamp.
pub fn encode_archive(meta: &PackageMetadata, archived_at: &str) -> Result<String> {
    let study = &meta.study;
    let key = format!("archive/{study}");
    validate_identifier(study, &key)?;
    validate_version(&meta.version, &key)?;
    let site = meta.site()?;
    validate_site(site, &key)?;
    validate_timestamp(archived_at, &key)?;
    let filename = meta.filename()?;
    validate_filename(filename, &key)?;
    Ok(format!(
        "archive/{study}/{site}/{}/{archived_at}/{filename}",
        meta.version
    ))
}

/// Move a decoded key into a different site-scoped subbucket, keeping the tuple.
pub fn rehome(key: &str, to: Subbucket) -> Result<String> {
    let decoded = decode(key)?;
    encode(to, &decoded.meta)
}

/// Sibling of a `.parquet` key with a different extension (`csv`).
pub fn sibling(key: &str, extension: &str) -> String {
    match key.strip_suffix(".parquet") {
        Some(stem) => format!("{stem}.{extension}"),
        None => format!("{key}.{extension}"),
    }
}

/// Split `folder` into `(head, version)` on its last separator.
fn split_version<'a>(folder: &'a str, key: &str) -> Result<(&'a str, &'a str)> {
    folder
        .rsplit_once(SEPARATOR)
        .ok_or_else(|| malformed(key, &format!("folder '{folder}' carries no version")))
}

/// Decode a key into its subbucket and tuple.
pub fn decode(key: &str) -> Result<DecodedKey> {
    let parts: Vec<&str> = key.split('/').collect();
    let subbucket: Subbucket = parts
        .first()
        .ok_or_else(|| malformed(key, "empty key"))?
        .parse()
        .map_err(|_| malformed(key, "unknown subbucket"))?;

    let mut archived_at = None;
    let meta = match (subbucket, parts.as_slice()) {
        (Subbucket::UploadStaging, [_, study, site, version, filename]) => {
            PackageMetadata::new(*study, *version)
                .with_site(*site)
                .with_filename(*filename)
        }
        (Subbucket::Upload, [_, study, dp, site, version, filename]) => {
            PackageMetadata::new(*study, *version)
                .with_data_package(*dp)
                .with_site(*site)
                .with_filename(*filename)
        }
        (s, [_, study, package, site, version, filename]) if s.is_site_scoped() => {
            let dp = package
                .strip_prefix(&format!("{study}{SEPARATOR}"))
                .ok_or_else(|| malformed(key, "package folder does not match study"))?;
            PackageMetadata::new(*study, *version)
                .with_data_package(dp)
                .with_site(*site)
                .with_filename(*filename)
        }
        (Subbucket::Aggregates, [_, study, package, versioned, filename]) => {
            let (head, version) = split_version(versioned, key)?;
            if head != *package {
                return Err(malformed(key, "version folder does not match package"));
            }
            let dp = package
                .strip_prefix(&format!("{study}{SEPARATOR}"))
                .ok_or_else(|| malformed(key, "package folder does not match study"))?;
            PackageMetadata::new(*study, version)
                .with_data_package(dp)
                .with_filename(*filename)
        }
        (Subbucket::Flat, [_, study, site, versioned, filename]) => {
            let (head, version) = split_version(versioned, key)?;
            let dp = head
                .strip_suffix(&format!("{SEPARATOR}{site}"))
                .and_then(|h| h.strip_prefix(&format!("{study}{SEPARATOR}")))
                .ok_or_else(|| malformed(key, "flat folder does not match study and site"))?;
            PackageMetadata::new(*study, version)
                .with_data_package(dp)
                .with_site(*site)
                .with_filename(*filename)
        }
        (Subbucket::Archive, [_, study, site, version, timestamp, filename]) => {
            archived_at = Some((*timestamp).to_string());
            PackageMetadata::new(*study, *version)
                .with_site(*site)
                .with_filename(*filename)
        }
        _ => return Err(malformed(key, "unexpected key shape")),
    };

    // Round-trip through the encoder so every component is validated once.
    let reencoded = match &archived_at {
        Some(ts) => encode_archive(&meta, ts)?,
        None => encode(subbucket, &meta)?,
    };
    if reencoded != key {
        return Err(malformed(key, "key is not canonical"));
    }

    Ok(DecodedKey {
        subbucket,
        meta,
        archived_at,
    })
}
