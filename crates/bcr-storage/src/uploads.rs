use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

const STAGING_DIR: &str = ".incoming";
const CHUNK: usize = 64 * 1024;

/// Sidecar kept next to each stored export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub content_hash: String,
    pub byte_size: u64,
    pub first_received_at: DateTime<Utc>,
    pub last_received_at: DateTime<Utc>,
    /// File names this content was submitted under, first submission first.
    pub original_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
    /// The same bytes were already on disk from an earlier submission.
    pub deduplicated: bool,
    pub metadata: UploadMetadata,
}

/// Content-addressed copies of submitted CSV exports, sharded by hash prefix.
///
/// A run references its upload by path; the file is never rewritten once
/// stored, so reprocessing a run always reads the bytes that were submitted.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard(content_hash: &str) -> PathBuf {
        PathBuf::from(content_hash.get(..2).unwrap_or("00"))
    }

    pub fn upload_relative_path(content_hash: &str) -> PathBuf {
        Self::shard(content_hash).join(format!("{content_hash}.csv"))
    }

    fn metadata_path(&self, content_hash: &str) -> PathBuf {
        self.root
            .join(Self::shard(content_hash))
            .join(format!("{content_hash}.json"))
    }

    /// Absolute location of a stored upload. Absolute inputs are returned as-is.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub async fn metadata(&self, content_hash: &str) -> anyhow::Result<Option<UploadMetadata>> {
        let path = self.metadata_path(content_hash);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading upload metadata {}", path.display()))
            }
        };
        let metadata = serde_json::from_str(&text)
            .with_context(|| format!("parsing upload metadata {}", path.display()))?;
        Ok(Some(metadata))
    }

    /// Copy `source` into staging while hashing it, then move it under its hash.
    /// Identical content is kept once; every submitted file name is recorded.
    pub async fn store_file(
        &self,
        received_at: DateTime<Utc>,
        source: impl AsRef<Path>,
    ) -> anyhow::Result<StoredUpload> {
        let source = source.as_ref();
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("creating staging directory {}", staging.display()))?;
        let staged = staging.join(format!("{}.part", Uuid::new_v4()));

        let (content_hash, byte_size) = match stage_copy(source, &staged).await {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&staged).await;
                return Err(err);
            }
        };

        let relative_path = Self::upload_relative_path(&content_hash);
        let absolute_path = self.root.join(&relative_path);
        let shard = self.root.join(Self::shard(&content_hash));
        fs::create_dir_all(&shard)
            .await
            .with_context(|| format!("creating upload directory {}", shard.display()))?;

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?;
        if deduplicated {
            let _ = fs::remove_file(&staged).await;
            debug!(path = %absolute_path.display(), "export already stored");
        } else if let Err(err) = fs::rename(&staged, &absolute_path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(err).with_context(|| {
                format!("moving upload {} -> {}", staged.display(), absolute_path.display())
            });
        }

        let original_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.csv".to_string());
        let metadata = self
            .record_submission(&content_hash, byte_size, received_at, original_name)
            .await?;
        info!(
            hash = %content_hash,
            bytes = byte_size,
            deduplicated,
            "export stored"
        );

        Ok(StoredUpload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size,
            deduplicated,
            metadata,
        })
    }

    async fn record_submission(
        &self,
        content_hash: &str,
        byte_size: u64,
        received_at: DateTime<Utc>,
        original_name: String,
    ) -> anyhow::Result<UploadMetadata> {
        let mut metadata = self
            .metadata(content_hash)
            .await?
            .unwrap_or_else(|| UploadMetadata {
                content_hash: content_hash.to_string(),
                byte_size,
                first_received_at: received_at,
                last_received_at: received_at,
                original_names: Vec::new(),
            });
        metadata.last_received_at = metadata.last_received_at.max(received_at);
        if !metadata.original_names.contains(&original_name) {
            metadata.original_names.push(original_name);
        }

        let path = self.metadata_path(content_hash);
        let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&metadata).context("serializing upload metadata")?;
        fs::write(&temp, json)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, &path)
            .await
            .with_context(|| format!("moving {} -> {}", temp.display(), path.display()))?;
        Ok(metadata)
    }
}

async fn stage_copy(source: &Path, staged: &Path) -> anyhow::Result<(String, u64)> {
    let mut input = fs::File::open(source)
        .await
        .with_context(|| format!("reading upload {}", source.display()))?;
    let mut output = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(staged)
        .await
        .with_context(|| format!("opening staged upload {}", staged.display()))?;

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .with_context(|| format!("reading upload {}", source.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("writing staged upload {}", staged.display()))?;
        size += n as u64;
    }
    output
        .flush()
        .await
        .with_context(|| format!("flushing staged upload {}", staged.display()))?;
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-03-{day:02}T09:30:00Z"))
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn sha(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn resubmitted_export_is_stored_once_and_names_are_kept() {
        let dir = tempdir().expect("tempdir");
        let csv = b"Email,First Name\nalice@x.com,Alice\n";
        let monday = dir.path().join("crm-monday.csv");
        let friday = dir.path().join("crm-friday.csv");
        fs::write(&monday, csv).await.expect("write");
        fs::write(&friday, csv).await.expect("write");
        let store = UploadStore::new(dir.path().join("uploads"));

        let first = store.store_file(at(2), &monday).await.expect("first");
        let second = store.store_file(at(6), &friday).await.expect("second");
        let again = store.store_file(at(7), &monday).await.expect("again");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(first.content_hash, sha(csv));
        assert!(first.relative_path.starts_with(&first.content_hash[..2]));
        assert_eq!(
            again.metadata.original_names,
            vec!["crm-monday.csv".to_string(), "crm-friday.csv".to_string()]
        );
        assert_eq!(again.metadata.first_received_at, at(2));
        assert_eq!(again.metadata.last_received_at, at(7));

        let on_disk = store.metadata(&first.content_hash).await.expect("meta").expect("some");
        assert_eq!(on_disk, again.metadata);
        assert_eq!(
            fs::read(store.resolve(&first.relative_path)).await.expect("read"),
            csv.to_vec()
        );

        let mut staged = fs::read_dir(store.root().join(STAGING_DIR)).await.expect("staging");
        assert!(staged.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn large_export_is_hashed_while_copied() {
        let dir = tempdir().expect("tempdir");
        let mut csv = b"Email\n".to_vec();
        for i in 0..20_000 {
            csv.extend_from_slice(format!("user{i}@x.com\n").as_bytes());
        }
        assert!(csv.len() > CHUNK * 3);
        let source = dir.path().join("big.csv");
        fs::write(&source, &csv).await.expect("write");
        let store = UploadStore::new(dir.path().join("uploads"));

        let stored = store.store_file(at(2), &source).await.expect("store");

        assert_eq!(stored.byte_size, csv.len() as u64);
        assert_eq!(stored.content_hash, sha(&csv));
        assert_eq!(fs::read(&stored.absolute_path).await.expect("read"), csv);
    }

    #[tokio::test]
    async fn unreadable_source_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path());
        let err = store
            .store_file(at(2), dir.path().join("nope.csv"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reading upload"));
        assert!(store.metadata(&sha(b"")).await.expect("meta").is_none());
    }
}
