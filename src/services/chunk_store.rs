use crate::models::video::Resolution;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter, SeekFrom};
use uuid::Uuid;

/// Copy buffer for merge streaming. Fragments are megabytes, so a large
/// buffer keeps the syscall count down.
const COPY_BUF_SIZE: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("chunk {index} is missing or unreadable")]
    MergeIncomplete { index: u32 },
    #[error("invalid byte range: {start}-{end}")]
    BadRange { start: i64, end: i64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

/// Owns the bytes on disk: chunk fragments under `<root>/chunks`, assembled
/// blobs and transcoded outputs under `<root>/files`. Path layout is
/// deterministic so every operation can recompute its target from
/// `(user, hash, ...)` alone.
pub struct ChunkStore {
    root: PathBuf,
}

/// The blob keeps the extension of the client-supplied filename (with its
/// leading dot), or no extension at all.
pub(crate) fn file_ext(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.root.join("chunks")).await?;
        fs::create_dir_all(self.root.join("files")).await?;
        Ok(())
    }

    pub fn chunk_path(&self, user: &str, hash: &str, index: &str) -> PathBuf {
        self.root
            .join("chunks")
            .join(format!("{user}_{hash}_{index}"))
    }

    pub fn blob_path(&self, user: &str, hash: &str, filename: &str) -> PathBuf {
        self.root
            .join("files")
            .join(format!("{user}_{hash}{}", file_ext(filename)))
    }

    pub fn blob_url(user: &str, hash: &str, filename: &str) -> String {
        format!("/files/{user}_{hash}{}", file_ext(filename))
    }

    pub fn output_path(&self, hash: &str, resolution: Resolution, ext: &str) -> PathBuf {
        self.root
            .join("files")
            .join(format!("{hash}_{resolution}{ext}"))
    }

    pub fn output_url(hash: &str, resolution: Resolution, ext: &str) -> String {
        format!("/files/{hash}_{resolution}{ext}")
    }

    /// Writes one chunk fragment atomically: the bytes land in a uniquely
    /// named temp file next to the target, then rename into place. A repeat
    /// write for the same index simply replaces the fragment.
    pub async fn write_chunk(
        &self,
        user: &str,
        hash: &str,
        index: &str,
        data: &[u8],
    ) -> std::io::Result<()> {
        let path = self.chunk_path(user, hash, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_file_name(format!(
            "{}.{}.part",
            path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        ));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Stat-only; never reads fragment content.
    pub async fn chunk_exists(&self, user: &str, hash: &str, index: &str) -> bool {
        fs::metadata(self.chunk_path(user, hash, index)).await.is_ok()
    }

    /// Concatenates fragments `0..total_chunks` in ascending index order into
    /// the blob. A missing fragment aborts with `MergeIncomplete` and removes
    /// the partial blob; fragments are deleted best-effort on success.
    pub async fn merge_chunks(
        &self,
        user: &str,
        hash: &str,
        filename: &str,
        total_chunks: u32,
    ) -> ChunkStoreResult<()> {
        let target = self.blob_path(user, hash, filename);
        let blob = fs::File::create(&target).await?;
        let mut writer = BufWriter::with_capacity(COPY_BUF_SIZE, blob);
        for index in 0..total_chunks {
            let fragment = self.chunk_path(user, hash, &index.to_string());
            let chunk = match fs::File::open(&fragment).await {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(%index, error = %err, "merge aborted, chunk unreadable");
                    drop(writer);
                    self.discard(&target).await;
                    return Err(ChunkStoreError::MergeIncomplete { index });
                }
            };
            let mut reader = BufReader::with_capacity(COPY_BUF_SIZE, chunk);
            if let Err(err) = tokio::io::copy_buf(&mut reader, &mut writer).await {
                drop(writer);
                self.discard(&target).await;
                return Err(ChunkStoreError::Io(err));
            }
        }
        if let Err(err) = writer.flush().await {
            self.discard(&target).await;
            return Err(ChunkStoreError::Io(err));
        }
        if let Err(err) = writer.into_inner().sync_all().await {
            self.discard(&target).await;
            return Err(ChunkStoreError::Io(err));
        }
        for index in 0..total_chunks {
            let fragment = self.chunk_path(user, hash, &index.to_string());
            if let Err(err) = fs::remove_file(&fragment).await {
                tracing::warn!(%index, error = %err, "failed to remove merged chunk");
            }
        }
        Ok(())
    }

    async fn discard(&self, target: &Path) {
        if let Err(err) = fs::remove_file(target).await {
            tracing::warn!(path = %target.display(), error = %err, "failed to remove partial blob");
        }
    }

    /// Reads `[start, end)` of the blob, clamping `start` into
    /// `[0, total)` and treating `end <= 0` (or past-the-end) as `total`.
    /// Returns the bytes and the blob's total size.
    pub async fn read_range(
        &self,
        user: &str,
        hash: &str,
        filename: &str,
        start: i64,
        end: i64,
    ) -> ChunkStoreResult<(Vec<u8>, i64)> {
        let path = self.blob_path(user, hash, filename);
        let total = fs::metadata(&path).await?.len() as i64;
        let start = start.max(0);
        let end = if end <= 0 || end > total { total } else { end };
        if start >= end {
            return Err(ChunkStoreError::BadRange { start, end });
        }
        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(start as u64)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok((buf, total))
    }

    pub async fn file_size(&self, user: &str, hash: &str, filename: &str) -> std::io::Result<u64> {
        Ok(fs::metadata(self.blob_path(user, hash, filename)).await?.len())
    }

    /// Blob removal for records whose last reference was dropped.
    pub async fn remove_blob(
        &self,
        user: &str,
        hash: &str,
        filename: &str,
    ) -> std::io::Result<()> {
        fs::remove_file(self.blob_path(user, hash, filename)).await
    }
}
