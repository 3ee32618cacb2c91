use crate::models::api::BusinessStatus;
use crate::models::api::code;
use crate::models::video::FileRecord;
use crate::services::chunk_store::ChunkStoreError;
use crate::services::states::ReelState;
use crate::services::states::db::DataBaseError;
use crate::utils::hash::is_valid_file_hash;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("file_hash must be a lowercase hex digest of length 32 or 64")]
    InvalidHash,
    #[error("file not found")]
    FileNotFound,
    #[error("storage error: {0}")]
    Storage(#[from] ChunkStoreError),
    #[error("database error: {0}")]
    Meta(#[from] DataBaseError),
}

impl BusinessStatus for ReadError {
    fn code(&self) -> i32 {
        match self {
            ReadError::InvalidHash => code::BAD_REQUEST,
            ReadError::FileNotFound => code::NOT_FOUND,
            ReadError::Storage(ChunkStoreError::BadRange { .. }) => code::BAD_REQUEST,
            ReadError::Storage(_) | ReadError::Meta(_) => code::INTERNAL,
        }
    }
}

pub type ReadResult<T> = Result<T, ReadError>;

/// Byte-range retrieval and file projections over the assembled blobs.
pub struct ReadService {
    state: Arc<ReelState>,
}

impl ReadService {
    pub fn new(state: Arc<ReelState>) -> Self {
        Self { state }
    }

    /// Resolves the file by hash, then requires the caller's principal to be
    /// its owner. A mismatch reads as not-found so probing cannot tell
    /// "exists, not yours" from "absent".
    pub async fn download_chunk(
        &self,
        principal: &str,
        file_hash: &str,
        start_byte: i64,
        end_byte: i64,
    ) -> ReadResult<(Vec<u8>, i64)> {
        if !is_valid_file_hash(file_hash) {
            return Err(ReadError::InvalidHash);
        }
        let file = self
            .state
            .db
            .files()
            .find_by_hash(file_hash)
            .await?
            .filter(|file| file.user_id == principal)
            .ok_or(ReadError::FileNotFound)?;
        let (data, total_size) = self
            .state
            .store
            .read_range(&file.user_id, file_hash, &file.filename, start_byte, end_byte)
            .await?;
        Ok((data, total_size))
    }

    pub async fn get_video_info(&self, user: &str, file_hash: &str) -> ReadResult<FileRecord> {
        if !is_valid_file_hash(file_hash) {
            return Err(ReadError::InvalidHash);
        }
        self.state
            .db
            .files()
            .find(file_hash, user)
            .await?
            .ok_or(ReadError::FileNotFound)
    }
}
