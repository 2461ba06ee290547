//! Atomic single-file snapshot writer/reader shared by the experience
//! store, outcome store, and goal planner (spec section 6 names the same
//! atomic-temp-rename pattern three times: `goals.json`,
//! `experiences_current.json`, `outcomes_current.json`).

use crate::error::PersistError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Snapshots larger than this are never loaded; they are quarantined
/// instead (spec section 8: "oversized persisted experience file
/// (> 30 MB): skipped, quarantined, system starts fresh").
pub const MAX_SNAPSHOT_BYTES: u64 = 30 * 1024 * 1024;

/// Write `value` to `path` atomically: serialize to a sibling `.tmp` file
/// in the same directory, then rename over the destination. A rename
/// within one filesystem is atomic, so readers never observe a partially
/// written file.
pub async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| PersistError::WriteFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let tmp_path = tmp_path_for(path);
    let json = serde_json::to_vec_pretty(value).map_err(|e| PersistError::WriteFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| PersistError::WriteFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| PersistError::WriteFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    Ok(())
}

/// Read and deserialize a snapshot from `path`.
///
/// - Missing file returns `Ok(None)` (first boot, fresh start).
/// - Oversize file is moved to `<parent>/.corrupted/` and `Ok(None)` is
///   returned (caller starts fresh, per spec section 8).
/// - A file that fails to parse is also quarantined, returning
///   `Ok(None)` rather than propagating the parse error, since the spec
///   requires the system to continue with a fresh state rather than fail
///   startup on a corrupted snapshot.
pub async fn read_atomic<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PersistError::ReadFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    };

    if meta.len() > MAX_SNAPSHOT_BYTES {
        tracing::warn!(path = %path.display(), size = meta.len(), cap = MAX_SNAPSHOT_BYTES, "snapshot oversize, quarantining and starting fresh");
        quarantine(path).await?;
        return Ok(None);
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PersistError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot failed to parse, quarantining and starting fresh");
            quarantine(path).await?;
            Ok(None)
        }
    }
}

/// Move a snapshot into a `.corrupted/` sibling directory rather than
/// deleting it, so the operator can inspect what went wrong.
async fn quarantine(path: &Path) -> Result<(), PersistError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let corrupted_dir = parent.join(".corrupted");
    tokio::fs::create_dir_all(&corrupted_dir)
        .await
        .map_err(|e| PersistError::WriteFailed {
            path: corrupted_dir.display().to_string(),
            message: e.to_string(),
        })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let stamped = format!("{}.{}", file_name, chrono::Utc::now().timestamp());
    let dest = corrupted_dir.join(stamped);

    tokio::fs::rename(path, &dest)
        .await
        .map_err(|e| PersistError::WriteFailed {
            path: dest.display().to_string(),
            message: e.to_string(),
        })?;

    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[tokio::test]
    async fn round_trip_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.json");
        write_atomic(&path, &Sample { value: 42 }).await.unwrap();
        let loaded: Option<Sample> = read_atomic(&path).await.unwrap();
        assert_eq!(loaded, Some(Sample { value: 42 }));
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Option<Sample> = read_atomic(&path).await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn corrupted_file_is_quarantined_not_deleted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let result: Result<Option<Sample>, _> = read_atomic(&path).await;
        assert_eq!(result.unwrap(), None);
        assert!(!path.exists());

        let quarantined = dir.path().join(".corrupted");
        let mut entries = tokio::fs::read_dir(&quarantined).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn no_partial_write_visible_to_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.json");
        write_atomic(&path, &Sample { value: 1 }).await.unwrap();
        write_atomic(&path, &Sample { value: 2 }).await.unwrap();
        let loaded: Option<Sample> = read_atomic(&path).await.unwrap();
        assert_eq!(loaded, Some(Sample { value: 2 }));
        assert!(!tmp_path_for(&path).exists());
    }
}
