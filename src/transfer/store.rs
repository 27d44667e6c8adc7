//! Per-machine content store
//!
//! Content lives at `<root>/cas/<first 3 hex>/<hex>.blob`. Incoming bytes
//! are first written to a temporary file under `<root>/staging`; the staged
//! file is removed when its guard drops, whatever the outcome.

use crate::error::{MeshError, MeshResult};
use crate::location::hash::{content_path_under, ContentHash};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const STAGING_DIR: &str = "staging";
const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes staged on disk, removed on drop unless committed
pub struct StagedContent {
    file: NamedTempFile,
    hash: ContentHash,
    bytes: u64,
}

impl StagedContent {
    /// Digest of the staged bytes
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Async writer over a staged file; the temp file keeps ownership of the path
pub fn staging_writer(file: &NamedTempFile) -> MeshResult<fs::File> {
    let std_file = file
        .as_file()
        .try_clone()
        .map_err(|e| MeshError::io("opening staging file", e))?;
    Ok(fs::File::from_std(std_file))
}

/// Directory-backed content store for one machine
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        content_path_under(&self.root, hash)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Create the store and staging directories
    pub async fn ensure_dirs(&self) -> MeshResult<()> {
        for dir in [self.root.join("cas"), self.staging_dir()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| MeshError::io(format!("creating directory {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::metadata(self.path_for(hash)).await.is_ok()
    }

    /// Size of stored content, if present
    pub async fn size(&self, hash: &ContentHash) -> Option<u64> {
        fs::metadata(self.path_for(hash)).await.ok().map(|m| m.len())
    }

    /// Create an empty staged file for a transport to write into
    pub fn staging_file(&self) -> MeshResult<NamedTempFile> {
        let dir = self.staging_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MeshError::io(format!("creating staging dir {}", dir.display()), e))?;
        tempfile::Builder::new()
            .prefix("incoming-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| MeshError::io("creating staging file", e))
    }

    /// Drain `reader` into a staged file, hashing as it goes
    pub async fn stage_from(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> MeshResult<StagedContent> {
        let file = self.staging_file()?;
        let mut out = staging_writer(&file)?;

        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| MeshError::io("reading pushed content", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .await
                .map_err(|e| MeshError::io("writing staging file", e))?;
            bytes += n as u64;
        }
        out.flush()
            .await
            .map_err(|e| MeshError::io("flushing staging file", e))?;

        Ok(StagedContent {
            file,
            hash: ContentHash::from_bytes(hasher.finalize().into()),
            bytes,
        })
    }

    /// Hash a staged file already filled by a transport
    pub async fn seal(&self, file: NamedTempFile) -> MeshResult<StagedContent> {
        let mut reader = fs::File::open(file.path())
            .await
            .map_err(|e| MeshError::io("reopening staging file", e))?;
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| MeshError::io("hashing staging file", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            bytes += n as u64;
        }
        Ok(StagedContent {
            file,
            hash: ContentHash::from_bytes(hasher.finalize().into()),
            bytes,
        })
    }

    /// Move staged content into place under its digest
    ///
    /// Returns false if the content was already present; the staged file is
    /// discarded either way.
    pub async fn commit(&self, staged: StagedContent) -> MeshResult<bool> {
        let target = self.path_for(&staged.hash);
        if fs::metadata(&target).await.is_ok() {
            return Ok(false);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MeshError::io(format!("creating {}", parent.display()), e))?;
        }
        staged
            .file
            .persist(&target)
            .map_err(|e| MeshError::io(format!("committing {}", target.display()), e.error))?;
        debug!(hash = %staged.hash.short(), bytes = staged.bytes, "Committed content");
        Ok(true)
    }

    /// Store bytes directly, returning their digest
    pub async fn put(&self, content: &[u8]) -> MeshResult<ContentHash> {
        let mut reader = content;
        let staged = self.stage_from(&mut reader).await?;
        let hash = staged.hash();
        self.commit(staged).await?;
        Ok(hash)
    }

    pub async fn read(&self, hash: &ContentHash) -> MeshResult<Vec<u8>> {
        let path = self.path_for(hash);
        match fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MeshError::ContentNotFound(hash.to_hex()))
            }
            Err(e) => Err(MeshError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// Remove content, returning its size if it was present
    pub async fn remove(&self, hash: &ContentHash) -> MeshResult<Option<u64>> {
        let path = self.path_for(hash);
        let Ok(metadata) = fs::metadata(&path).await else {
            return Ok(None);
        };
        fs::remove_file(&path)
            .await
            .map_err(|e| MeshError::io(format!("removing {}", path.display()), e))?;
        Ok(Some(metadata.len()))
    }

    /// Number of files currently in staging
    pub async fn staged_count(&self) -> MeshResult<usize> {
        let dir = self.staging_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::io("reading staging dir", e))?;
        let mut count = 0;
        while entries
            .next_entry()
            .await
            .map_err(|e| MeshError::io("reading staging entry", e))?
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }
}
