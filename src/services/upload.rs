use crate::models::api::BusinessStatus;
use crate::models::api::code;
use crate::models::video::FileStatus;
use crate::services::chunk_store::{ChunkStore, ChunkStoreError};
use crate::services::states::ReelState;
use crate::services::states::cache::UPLOADING;
use crate::services::states::db::{DataBaseError, NewFinalizedFile};
use crate::utils::hash::{is_canonical_chunk_index, is_valid_file_hash};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file_hash must be a lowercase hex digest of length 32 or 64")]
    InvalidHash,
    #[error("chunk index must be a decimal string")]
    InvalidChunkIndex,
    #[error("chunk data must not be empty")]
    EmptyChunk,
    #[error("filename must not be empty")]
    EmptyFilename,
    #[error("total_chunks must be greater than zero")]
    InvalidTotalChunks,
    #[error("分片未上传完整: {present}/{total}")]
    IncompleteUpload { present: u32, total: u32 },
    #[error("storage error: {0}")]
    Storage(#[from] ChunkStoreError),
    #[error("database error: {0}")]
    Meta(#[from] DataBaseError),
}

impl BusinessStatus for UploadError {
    fn code(&self) -> i32 {
        match self {
            UploadError::InvalidHash
            | UploadError::InvalidChunkIndex
            | UploadError::EmptyChunk
            | UploadError::EmptyFilename
            | UploadError::InvalidTotalChunks
            | UploadError::IncompleteUpload { .. } => code::BAD_REQUEST,
            UploadError::Storage(_) | UploadError::Meta(_) => code::INTERNAL,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, PartialEq, Eq)]
pub enum InitUploadOutcome {
    /// The content is already finalized (or the request-id was already
    /// processed); the client skips the upload entirely.
    Existing {
        status: FileStatus,
        url: String,
        replayed: bool,
    },
    /// A session is in flight; the client resumes with the missing indices.
    Resumed { finished_chunks: Vec<String> },
    /// First contact for this `(user, hash)`.
    Fresh,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub url: String,
}

/// The per-`(user, file_hash)` session state machine over ChunkStore,
/// MetaStore and the hot cache.
pub struct UploadService {
    state: Arc<ReelState>,
}

impl UploadService {
    pub fn new(state: Arc<ReelState>) -> Self {
        Self { state }
    }

    /// Consult order is load-bearing: the request-id probe first, so a
    /// client that crashed after finalization replays its prior answer; then
    /// the two instant-hit probes (tombstone, durable record); then resume;
    /// then fresh.
    pub async fn init_upload(
        &self,
        user: &str,
        file_hash: &str,
        request_id: &str,
    ) -> UploadResult<InitUploadOutcome> {
        if !is_valid_file_hash(file_hash) {
            return Err(UploadError::InvalidHash);
        }
        if !request_id.is_empty()
            && let Some(existing) = self.state.db.files().find_by_request_id(request_id).await?
        {
            tracing::info!(%request_id, "init replayed from request id");
            return Ok(InitUploadOutcome::Existing {
                status: existing.status,
                url: existing.url,
                replayed: true,
            });
        }
        if let Some(url) = self.state.cache.tombstone(user, file_hash).await {
            tracing::info!(%user, %file_hash, "instant hit via tombstone");
            return Ok(InitUploadOutcome::Existing {
                status: FileStatus::Finished,
                url,
                replayed: false,
            });
        }
        if let Some(file) = self.state.db.files().find_finished(file_hash, user).await? {
            tracing::info!(%user, %file_hash, "instant hit via metadata store");
            self.state.cache.set_tombstone(user, file_hash, &file.url).await;
            return Ok(InitUploadOutcome::Existing {
                status: FileStatus::Finished,
                url: file.url,
                replayed: false,
            });
        }
        if self.state.cache.upload_status(user, file_hash).await.as_deref() == Some(UPLOADING) {
            let finished_chunks = self.state.cache.finished_chunks(user, file_hash).await;
            tracing::info!(%user, %file_hash, chunks = finished_chunks.len(), "resuming session");
            return Ok(InitUploadOutcome::Resumed { finished_chunks });
        }
        self.state
            .cache
            .set_upload_status(user, file_hash, UPLOADING)
            .await;
        tracing::info!(%user, %file_hash, "fresh upload session");
        Ok(InitUploadOutcome::Fresh)
    }

    /// At-least-once safe: a fragment that already exists is skipped, and a
    /// repeated write just lands the same bytes again. The chunk set is only
    /// advanced after the fragment is durably on disk.
    pub async fn upload_chunk(
        &self,
        user: &str,
        file_hash: &str,
        index: &str,
        data: &[u8],
    ) -> UploadResult<()> {
        if !is_valid_file_hash(file_hash) {
            return Err(UploadError::InvalidHash);
        }
        if !is_canonical_chunk_index(index) {
            return Err(UploadError::InvalidChunkIndex);
        }
        if data.is_empty() {
            return Err(UploadError::EmptyChunk);
        }
        if self.state.store.chunk_exists(user, file_hash, index).await {
            tracing::debug!(%user, %file_hash, %index, "chunk already present, skipping");
            return Ok(());
        }
        self.state
            .store
            .write_chunk(user, file_hash, index, data)
            .await
            .map_err(ChunkStoreError::Io)?;
        // Merge reads the ground truth from ChunkStore, so the progress set
        // is advisory and its update is best-effort.
        self.state
            .cache
            .add_finished_chunk(user, file_hash, index)
            .await;
        Ok(())
    }

    /// Finalization. Completeness is judged on index identity: every index
    /// in `0..total_chunks` must be in the finished set. After the blob is
    /// assembled, metadata and cache writes are logged-not-fatal — the blob
    /// on disk is the commit point.
    pub async fn merge_file(
        &self,
        user: &str,
        file_hash: &str,
        filename: &str,
        total_chunks: u32,
        fallback_width: u16,
        fallback_height: u16,
        request_id: &str,
    ) -> UploadResult<MergeOutcome> {
        if !is_valid_file_hash(file_hash) {
            return Err(UploadError::InvalidHash);
        }
        if filename.is_empty() {
            return Err(UploadError::EmptyFilename);
        }
        if total_chunks == 0 {
            return Err(UploadError::InvalidTotalChunks);
        }
        if !request_id.is_empty()
            && let Some(existing) = self.state.db.files().find_by_request_id(request_id).await?
        {
            tracing::info!(%request_id, "merge replayed from request id");
            return Ok(MergeOutcome { url: existing.url });
        }

        let finished = self.state.cache.finished_chunk_set(user, file_hash).await;
        let present = (0..total_chunks)
            .filter(|index| finished.contains(&index.to_string()))
            .count() as u32;
        if present < total_chunks {
            return Err(UploadError::IncompleteUpload {
                present,
                total: total_chunks,
            });
        }

        self.state
            .store
            .merge_chunks(user, file_hash, filename, total_chunks)
            .await?;

        let blob_path = self.state.store.blob_path(user, file_hash, filename);
        let (width, height) = match self.state.encoder.probe_resolution(&blob_path).await {
            Ok(dims) => dims,
            Err(err) => {
                tracing::warn!(error = %err, "resolution probe unavailable, using caller dimensions");
                (fallback_width, fallback_height)
            }
        };

        let url = ChunkStore::blob_url(user, file_hash, filename);
        let file_size = self
            .state
            .store
            .file_size(user, file_hash, filename)
            .await
            .map_err(ChunkStoreError::Io)?;

        match self
            .state
            .db
            .files()
            .create_finalized(NewFinalizedFile {
                file_hash,
                user_id: user,
                filename,
                file_size: file_size as i64,
                url: &url,
                width,
                height,
                request_id,
            })
            .await
        {
            Ok(_) => {}
            Err(DataBaseError::AlreadyExists { msg }) => {
                tracing::info!(%user, %file_hash, %msg, "file already finalized, reconciling");
            }
            Err(err) => {
                tracing::error!(%user, %file_hash, error = %err, "failed to record finalized file");
            }
        }

        self.state.cache.set_tombstone(user, file_hash, &url).await;
        self.state.cache.drop_upload_session(user, file_hash).await;
        tracing::info!(%user, %file_hash, %url, width, height, "file merged");
        Ok(MergeOutcome { url })
    }

    /// Drops one reference to a finalized file. When the count reaches zero
    /// the record is deleted inside the decrement transaction, and the blob
    /// and tombstone are removed best-effort afterwards. Returns whether the
    /// file was deleted.
    pub async fn release_file(&self, user: &str, file_hash: &str) -> UploadResult<bool> {
        if !is_valid_file_hash(file_hash) {
            return Err(UploadError::InvalidHash);
        }
        let Some(dead) = self.state.db.files().dec_ref(file_hash, user).await? else {
            return Ok(false);
        };
        if let Err(err) = self
            .state
            .store
            .remove_blob(user, file_hash, &dead.filename)
            .await
        {
            tracing::warn!(%user, %file_hash, error = %err, "failed to remove released blob");
        }
        self.state.cache.remove_tombstone(user, file_hash).await;
        tracing::info!(%user, %file_hash, "file released and deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::states::testing;

    const HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[tokio::test]
    async fn fresh_upload_to_instant_hit() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());

        assert_eq!(
            svc.init_upload("anonymous", HASH, "").await.unwrap(),
            InitUploadOutcome::Fresh
        );
        let chunk0 = vec![7u8; 2048];
        let chunk1 = vec![9u8; 1024];
        svc.upload_chunk("anonymous", HASH, "0", &chunk0).await.unwrap();
        svc.upload_chunk("anonymous", HASH, "1", &chunk1).await.unwrap();

        let merged = svc
            .merge_file("anonymous", HASH, "v.mp4", 2, 640, 360, "")
            .await
            .unwrap();
        assert_eq!(merged.url, format!("/files/anonymous_{HASH}.mp4"));

        // the durable record exists with probe-fallback dimensions
        let record = env
            .state
            .db
            .files()
            .find_finished(HASH, "anonymous")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.file_size, 3072);
        assert_eq!((record.width, record.height), (640, 360));

        // session keys are gone, the tombstone answers the next init
        assert_eq!(env.state.cache.upload_status("anonymous", HASH).await, None);
        match svc.init_upload("anonymous", HASH, "").await.unwrap() {
            InitUploadOutcome::Existing { status, url, replayed } => {
                assert_eq!(status, FileStatus::Finished);
                assert_eq!(url, merged.url);
                assert!(!replayed);
            }
            other => panic!("expected instant hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn instant_hit_survives_cache_flush() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("anonymous", HASH, "").await.unwrap();
        svc.upload_chunk("anonymous", HASH, "0", b"data").await.unwrap();
        let merged = svc
            .merge_file("anonymous", HASH, "v.mp4", 1, 0, 0, "")
            .await
            .unwrap();

        // cold cache, same database: the durable probe answers and reseeds
        // the tombstone
        let (state, _rx) = env.restart();
        let svc = UploadService::new(state.clone());
        match svc.init_upload("anonymous", HASH, "").await.unwrap() {
            InitUploadOutcome::Existing { status, url, .. } => {
                assert_eq!(status, FileStatus::Finished);
                assert_eq!(url, merged.url);
            }
            other => panic!("expected instant hit, got {other:?}"),
        }
        assert_eq!(
            state.cache.tombstone("anonymous", HASH).await.as_deref(),
            Some(merged.url.as_str())
        );
    }

    #[tokio::test]
    async fn resume_reports_finished_chunks() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        assert_eq!(
            svc.init_upload("u", HASH, "").await.unwrap(),
            InitUploadOutcome::Fresh
        );
        svc.upload_chunk("u", HASH, "0", b"x").await.unwrap();
        match svc.init_upload("u", HASH, "").await.unwrap() {
            InitUploadOutcome::Resumed { finished_chunks } => {
                assert_eq!(finished_chunks, vec!["0"]);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_id_replays_identically() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("u", HASH, "").await.unwrap();
        svc.upload_chunk("u", HASH, "0", b"x").await.unwrap();
        let merged = svc
            .merge_file("u", HASH, "v.mp4", 1, 0, 0, "R1")
            .await
            .unwrap();

        // replaying the merge or the init with the same token returns the
        // same url without re-touching storage
        let replay = svc.merge_file("u", HASH, "v.mp4", 1, 0, 0, "R1").await.unwrap();
        assert_eq!(replay.url, merged.url);
        for _ in 0..2 {
            match svc.init_upload("u", HASH, "R1").await.unwrap() {
                InitUploadOutcome::Existing { status, url, replayed } => {
                    assert_eq!(status, FileStatus::Finished);
                    assert_eq!(url, merged.url);
                    assert!(replayed);
                }
                other => panic!("expected replay, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn merge_rejects_missing_indices() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("u", HASH, "").await.unwrap();
        svc.upload_chunk("u", HASH, "0", b"a").await.unwrap();
        svc.upload_chunk("u", HASH, "2", b"c").await.unwrap();
        let err = svc
            .merge_file("u", HASH, "v.mp4", 3, 0, 0, "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "分片未上传完整: 2/3");
        assert_eq!(err.code(), 400);
        assert!(env.state.db.files().find(HASH, "u").await.unwrap().is_none());

        // duplicate high index cannot fake completeness either
        svc.upload_chunk("u", HASH, "5", b"e").await.unwrap();
        let err = svc
            .merge_file("u", HASH, "v.mp4", 3, 0, 0, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload { present: 2, total: 3 }
        ));
    }

    #[tokio::test]
    async fn duplicate_chunk_upload_is_a_no_op() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("u", HASH, "").await.unwrap();
        svc.upload_chunk("u", HASH, "0", b"original").await.unwrap();
        svc.upload_chunk("u", HASH, "0", b"ignored-rewrite").await.unwrap();
        let bytes = tokio::fs::read(env.state.store.chunk_path("u", HASH, "0"))
            .await
            .unwrap();
        assert_eq!(bytes, b"original");
    }

    #[tokio::test]
    async fn validation_rejects_bad_input() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        assert!(matches!(
            svc.init_upload("u", "not-hex", "").await.unwrap_err(),
            UploadError::InvalidHash
        ));
        assert!(matches!(
            svc.upload_chunk("u", HASH, "", b"x").await.unwrap_err(),
            UploadError::InvalidChunkIndex
        ));
        assert!(matches!(
            svc.upload_chunk("u", HASH, "0", b"").await.unwrap_err(),
            UploadError::EmptyChunk
        ));
        assert!(matches!(
            svc.merge_file("u", HASH, "", 2, 0, 0, "").await.unwrap_err(),
            UploadError::EmptyFilename
        ));
        assert!(matches!(
            svc.merge_file("u", HASH, "v.mp4", 0, 0, 0, "").await.unwrap_err(),
            UploadError::InvalidTotalChunks
        ));
    }

    #[tokio::test]
    async fn release_file_deletes_at_last_reference() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("u", HASH, "").await.unwrap();
        svc.upload_chunk("u", HASH, "0", b"payload").await.unwrap();
        svc.merge_file("u", HASH, "v.mp4", 1, 0, 0, "").await.unwrap();
        env.state.db.files().inc_ref(HASH, "u").await.unwrap();

        // two references: the first release keeps everything in place
        assert!(!svc.release_file("u", HASH).await.unwrap());
        assert!(env.state.db.files().find(HASH, "u").await.unwrap().is_some());

        assert!(svc.release_file("u", HASH).await.unwrap());
        assert!(env.state.db.files().find(HASH, "u").await.unwrap().is_none());
        assert!(
            tokio::fs::metadata(env.state.store.blob_path("u", HASH, "v.mp4"))
                .await
                .is_err()
        );
        // with record, blob and tombstone gone, the hash starts fresh
        assert_eq!(
            svc.init_upload("u", HASH, "").await.unwrap(),
            InitUploadOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn users_do_not_share_sessions() {
        let env = testing::env().await;
        let svc = UploadService::new(env.state.clone());
        svc.init_upload("alice", HASH, "").await.unwrap();
        svc.upload_chunk("alice", HASH, "0", b"a").await.unwrap();
        svc.merge_file("alice", HASH, "v.mp4", 1, 0, 0, "").await.unwrap();
        // the same hash under another principal starts from scratch
        assert_eq!(
            svc.init_upload("bob", HASH, "").await.unwrap(),
            InitUploadOutcome::Fresh
        );
    }
}
