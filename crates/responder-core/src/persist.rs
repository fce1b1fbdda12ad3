//! Whole-file JSON persistence.
//!
//! Every write serializes the complete document, writes it next to the target
//! and renames it into place, so a crash mid-write leaves the previous file
//! intact. Writes are bounded by a timeout and never hang the caller.

use core::time::Duration;
use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;

use crate::error::StoreError;

/// Read and decode `path`. A missing file yields `Ok(None)`.
///
/// # Errors
///
/// Returns [`StoreError::Io`] when the file exists but cannot be read and
/// [`StoreError::Decode`] when its content is not valid JSON for `T`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            path: path.to_owned(),
            source,
        })
}

/// Replace `path` with the pretty-printed JSON encoding of `value`.
///
/// # Errors
///
/// Returns [`StoreError::Encode`], [`StoreError::Io`] or
/// [`StoreError::Timeout`]; on any error the previous file content is kept.
pub async fn write_json_atomic<T>(path: &Path, value: &T, limit: Duration) -> Result<(), StoreError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_owned(),
        source,
    })?;
    match tokio::time::timeout(limit, replace_file(path, &payload)).await {
        Ok(result) => result.map_err(|source| StoreError::Io {
            path: path.to_owned(),
            source,
        }),
        Err(_elapsed) => Err(StoreError::Timeout {
            path: path.to_owned(),
            after: limit,
        }),
    }
}

async fn replace_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(path);
    if let Err(e) = fs::write(&temp, payload).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("data"), |n| n.to_os_string());
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<BTreeMap<String, String>> =
            read_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn write_creates_parent_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");
        let value = BTreeMap::from([("a".to_owned(), "b".to_owned())]);

        write_json_atomic(&path, &value, LIMIT).await.unwrap();

        let back: BTreeMap<String, String> = read_json(&path).await.unwrap().unwrap();
        assert_eq!(back, value);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_rename_reports_io_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::create_dir(&path).unwrap();

        let err = write_json_atomic(&path, &vec![1, 2, 3], LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = read_json::<BTreeMap<String, String>>(&path)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
