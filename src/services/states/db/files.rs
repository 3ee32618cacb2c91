use crate::models::video::{FileRecord, FileStatus, TranscodeStatus};
use crate::services::states::db::{
    DataBaseError, DataBaseResult, SqliteBaseResultExt, SqliteQueryResultExt,
};
use sqlx::SqlitePool;
use time::OffsetDateTime;

#[derive(Debug)]
pub struct NewFinalizedFile<'a> {
    pub file_hash: &'a str,
    pub user_id: &'a str,
    pub filename: &'a str,
    pub file_size: i64,
    pub url: &'a str,
    pub width: u16,
    pub height: u16,
    pub request_id: &'a str,
}

pub struct FileRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FileRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, file_hash: &str, user_id: &str) -> DataBaseResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM video_files WHERE file_hash = ? AND user_id = ?",
        )
        .bind(file_hash)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await
        .resolve()
    }

    pub async fn find_finished(
        &self,
        file_hash: &str,
        user_id: &str,
    ) -> DataBaseResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM video_files WHERE file_hash = ? AND user_id = ? AND status = ?",
        )
        .bind(file_hash)
        .bind(user_id)
        .bind(FileStatus::Finished)
        .fetch_optional(self.pool)
        .await
        .resolve()
    }

    pub async fn find_by_hash(&self, file_hash: &str) -> DataBaseResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM video_files WHERE file_hash = ? LIMIT 1")
            .bind(file_hash)
            .fetch_optional(self.pool)
            .await
            .resolve()
    }

    /// Idempotency probe; callers must skip this for empty tokens.
    pub async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> DataBaseResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM video_files WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(self.pool)
            .await
            .resolve()
    }

    /// Inserts a finalized record (`status = finished`, `ref_count = 1`).
    /// A duplicate `(file_hash, user_id)` or `request_id` surfaces as
    /// [`DataBaseError::AlreadyExists`], which merge treats as reconciled.
    pub async fn create_finalized(&self, new: NewFinalizedFile<'_>) -> DataBaseResult<i64> {
        let now = OffsetDateTime::now_utc();
        let request_id = (!new.request_id.is_empty()).then_some(new.request_id);
        let result = sqlx::query(
            "INSERT INTO video_files \
             (file_hash, user_id, filename, file_size, url, status, width, height, \
              ref_count, request_id, transcode_status, transcode_urls, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, '[]', ?, ?)",
        )
        .bind(new.file_hash)
        .bind(new.user_id)
        .bind(new.filename)
        .bind(new.file_size)
        .bind(new.url)
        .bind(FileStatus::Finished)
        .bind(new.width)
        .bind(new.height)
        .bind(request_id)
        .bind(TranscodeStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .resolve()?;
        Ok(result.last_insert_rowid())
    }

    pub async fn inc_ref(&self, file_hash: &str, user_id: &str) -> DataBaseResult<()> {
        sqlx::query(
            "UPDATE video_files SET ref_count = ref_count + 1, updated_at = ? \
             WHERE file_hash = ? AND user_id = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(file_hash)
        .bind(user_id)
        .execute(self.pool)
        .await
        .resolve_affected()?;
        Ok(())
    }

    /// Decrements the reference count inside a transaction. When the count
    /// drops to zero the row is deleted and returned so the caller can remove
    /// the backing blob (best-effort, outside the transaction).
    pub async fn dec_ref(
        &self,
        file_hash: &str,
        user_id: &str,
    ) -> DataBaseResult<Option<FileRecord>> {
        let mut tx = self.pool.begin().await.resolve()?;
        let updated = sqlx::query(
            "UPDATE video_files SET ref_count = ref_count - 1, updated_at = ? \
             WHERE file_hash = ? AND user_id = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(file_hash)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .resolve()?;
        if updated.rows_affected() == 0 {
            return Err(DataBaseError::NoAffectedRows);
        }
        let dead = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM video_files WHERE file_hash = ? AND user_id = ? AND ref_count <= 0",
        )
        .bind(file_hash)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .resolve()?;
        if let Some(record) = &dead {
            sqlx::query("DELETE FROM video_files WHERE id = ?")
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .resolve()?;
        }
        tx.commit().await.resolve()?;
        Ok(dead)
    }

    /// Mirrors terminal transcode state onto the owning file row for fast
    /// `GetVideoInfo` lookups. Missing rows are a no-op.
    pub async fn set_transcode_state(
        &self,
        file_hash: &str,
        user_id: &str,
        status: TranscodeStatus,
        transcode_urls_json: &str,
    ) -> DataBaseResult<()> {
        sqlx::query(
            "UPDATE video_files SET transcode_status = ?, transcode_urls = ?, updated_at = ? \
             WHERE file_hash = ? AND user_id = ?",
        )
        .bind(status)
        .bind(transcode_urls_json)
        .bind(OffsetDateTime::now_utc())
        .bind(file_hash)
        .bind(user_id)
        .execute(self.pool)
        .await
        .resolve()?;
        Ok(())
    }
}
