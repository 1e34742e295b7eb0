//! Staged zip extraction.
//!
//! A site uploads one zip per study export. Its children are written under
//! `upload/`, the upload transaction is recorded before any child event is
//! published, and the zip itself is moved to `archive/`.

use bytes::Bytes;
use cumulus_common::files::data_package_from_filename;
use cumulus_common::keys::{decode, encode, encode_archive, normalize_version, Subbucket};
use cumulus_common::metadata::{upload_transaction_key, UploadTransaction};
use cumulus_common::{CumulusError, FileCategory, PackageMetadata};
use serde::Deserialize;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{timestamp_now, PipelineContext, PipelineError};
use crate::messaging::Topic;
use crate::storage::write_json;

pub const MANIFEST_FILENAME: &str = "manifest.toml";

/// Export manifest shipped inside every upload. Only used for bookkeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub study_prefix: String,
    #[serde(default)]
    pub export_config: toml::Table,
}

struct Child {
    filename: String,
    category: FileCategory,
    key: String,
    data: Vec<u8>,
}

#[instrument(skip(ctx), fields(key = %key))]
pub async fn process_staged_upload(ctx: &PipelineContext, key: &str) -> Result<String, PipelineError> {
    let Some(_) = ctx.store.head(key).await? else {
        return Ok("Nothing to process".to_string());
    };
    let staged = decode(key)?;
    if staged.subbucket != Subbucket::UploadStaging {
        return Err(CumulusError::MalformedKey(key.to_string()).into());
    }
    let study = staged.meta.study.clone();
    let site = staged.meta.site()?.to_string();
    let version = normalize_version(&staged.meta.version);

    let data = ctx.store.get(key).await?;
    let (manifest, children) = extract(data, &study, &site, &version)?;
    match &manifest {
        Some(m) if m.study_prefix != study => warn!(
            manifest_study = %m.study_prefix,
            "Manifest study prefix does not match the upload path"
        ),
        Some(m) => info!(exports = m.export_config.len(), "Read upload manifest"),
        None => warn!("Upload has no manifest"),
    }

    let mut transaction = UploadTransaction {
        id: Uuid::new_v4().to_string(),
        uploaded_at: timestamp_now(),
        version: version.clone(),
        cube: Vec::new(),
        flat: Vec::new(),
        annotated_cube: Vec::new(),
    };
    for child in &children {
        match child.category {
            FileCategory::Cube | FileCategory::OtherParquet => {
                transaction.cube.push(child.filename.clone())
            }
            FileCategory::AnnotatedCube => transaction.annotated_cube.push(child.filename.clone()),
            FileCategory::Flat => transaction.flat.push(child.filename.clone()),
            _ => {}
        }
    }
    write_json(
        ctx.store.as_ref(),
        &upload_transaction_key(&site, &study),
        &transaction,
    )
    .await?;

    let extracted = children.len();
    for child in children {
        ctx.store.put(&child.key, Bytes::from(child.data), None).await?;
        ctx.publish(Topic::ProcessUpload, &child.key, &site).await?;
    }

    let archived = encode_archive(&staged.meta, &timestamp_now())?;
    ctx.store.move_object(key, &archived).await?;

    info!(
        transaction = %transaction.id,
        files = extracted,
        "Extracted upload"
    );
    Ok(format!("Extracted {} files", extracted))
}

fn extract(
    data: Bytes,
    study: &str,
    site: &str,
    version: &str,
) -> Result<(Option<Manifest>, Vec<Child>), PipelineError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut manifest = None;
    let mut children = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let Some(filename) = entry
            .enclosed_name()
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            warn!(entry = %entry.name(), "Skipping zip entry with an unsafe name");
            continue;
        };

        if filename == MANIFEST_FILENAME {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            manifest = Some(toml::from_str::<Manifest>(&text)?);
            continue;
        }

        let data_package = match data_package_from_filename(study, &filename) {
            Ok(dp) => dp,
            Err(e) => {
                warn!(file = %filename, error = %e, "Skipping file outside the study");
                continue;
            }
        };
        let meta = PackageMetadata::new(study, version)
            .with_data_package(data_package)
            .with_site(site)
            .with_filename(filename.as_str());
        let key = encode(Subbucket::Upload, &meta)?;

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        children.push(Child {
            category: FileCategory::classify(&filename),
            filename,
            key,
            data: buf,
        });
    }

    Ok((manifest, children))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_of(files: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[test]
    fn test_extract_routes_children_under_upload() {
        let data = zip_of(&[
            (
                "manifest.toml",
                b"study_prefix = \"core\"\n[export_config]\ncount_list = [\"count_encounter\"]\n",
            ),
            ("nested/core__count_encounter.cube.parquet", b"pq"),
            ("core__patients.flat.parquet", b"pq"),
            ("other__x.cube.parquet", b"pq"),
        ]);

        let (manifest, children) = extract(data, "core", "site_a", "099").unwrap();
        let manifest = manifest.unwrap();
        assert_eq!(manifest.study_prefix, "core");
        assert!(manifest.export_config.contains_key("count_list"));

        let keys: Vec<_> = children.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "upload/core/count_encounter/site_a/099/core__count_encounter.cube.parquet",
                "upload/core/patients/site_a/099/core__patients.flat.parquet",
            ]
        );
        assert_eq!(children[1].category, FileCategory::Flat);
    }

    #[test]
    fn test_bad_manifest_fails() {
        let data = zip_of(&[("manifest.toml", b"study_prefix = ")]);
        assert!(matches!(
            extract(data, "core", "site_a", "099"),
            Err(PipelineError::Manifest(_))
        ));
    }
}
