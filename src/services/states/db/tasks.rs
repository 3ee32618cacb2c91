use crate::models::video::{TaskRecord, TranscodeStatus};
use crate::services::states::db::{DataBaseResult, SqliteBaseResultExt};
use sqlx::SqlitePool;
use time::OffsetDateTime;

#[derive(Debug)]
pub struct NewTask<'a> {
    pub task_id: &'a str,
    pub file_hash: &'a str,
    pub user_id: &'a str,
    pub resolutions_json: &'a str,
    pub request_id: &'a str,
}

pub struct TaskRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TaskRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewTask<'_>) -> DataBaseResult<()> {
        let now = OffsetDateTime::now_utc();
        let request_id = (!new.request_id.is_empty()).then_some(new.request_id);
        sqlx::query(
            "INSERT INTO transcode_tasks \
             (task_id, file_hash, user_id, resolutions, status, progress, result_urls, \
              request_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, '[]', ?, ?, ?)",
        )
        .bind(new.task_id)
        .bind(new.file_hash)
        .bind(new.user_id)
        .bind(new.resolutions_json)
        .bind(TranscodeStatus::Pending)
        .bind(request_id)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .resolve()?;
        Ok(())
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> DataBaseResult<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM transcode_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.pool)
            .await
            .resolve()
    }

    /// Idempotency probe; callers must skip this for empty tokens.
    pub async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> DataBaseResult<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM transcode_tasks WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(self.pool)
            .await
            .resolve()
    }

    /// Updates task lifecycle state. `result_urls` is written only when
    /// provided so a late failure mark never clobbers partial successes.
    pub async fn update_progress(
        &self,
        task_id: &str,
        status: TranscodeStatus,
        progress: i32,
        result_urls_json: Option<&str>,
    ) -> DataBaseResult<()> {
        let now = OffsetDateTime::now_utc();
        match result_urls_json {
            Some(urls) => {
                sqlx::query(
                    "UPDATE transcode_tasks SET status = ?, progress = ?, result_urls = ?, \
                     updated_at = ? WHERE task_id = ?",
                )
                .bind(status)
                .bind(progress)
                .bind(urls)
                .bind(now)
                .bind(task_id)
                .execute(self.pool)
                .await
                .resolve()?;
            }
            None => {
                sqlx::query(
                    "UPDATE transcode_tasks SET status = ?, progress = ?, updated_at = ? \
                     WHERE task_id = ?",
                )
                .bind(status)
                .bind(progress)
                .bind(now)
                .bind(task_id)
                .execute(self.pool)
                .await
                .resolve()?;
            }
        }
        Ok(())
    }

    /// Tasks awaiting a worker, oldest first. Used by crash-restart
    /// rehydration.
    pub async fn pending(&self, limit: u32) -> DataBaseResult<Vec<TaskRecord>> {
        sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM transcode_tasks WHERE status = ? ORDER BY id LIMIT ?",
        )
        .bind(TranscodeStatus::Pending)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await
        .resolve()
    }
}
