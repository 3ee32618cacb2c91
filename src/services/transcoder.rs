use crate::models::api::BusinessStatus;
use crate::models::api::code;
use crate::models::video::{Resolution, TaskRecord, TranscodeStatus};
use crate::services::chunk_store::file_ext;
use crate::services::states::ReelState;
use crate::services::states::config::TranscodeConfig;
use crate::services::states::db::{DataBaseError, NewTask};
use crate::utils::hash::is_valid_file_hash;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("file_hash must be a lowercase hex digest of length 32 or 64")]
    InvalidHash,
    #[error("resolutions must not be empty")]
    EmptyResolutions,
    #[error("unsupported resolution: {0}")]
    UnsupportedResolution(String),
    #[error("task_id must not be empty")]
    EmptyTaskId,
    #[error("file not found")]
    FileNotFound,
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("transcode queue is full")]
    QueueFull,
    #[error("transcode queue is closed")]
    QueueClosed,
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Meta(#[from] DataBaseError),
}

impl BusinessStatus for TranscodeError {
    fn code(&self) -> i32 {
        match self {
            TranscodeError::InvalidHash
            | TranscodeError::EmptyResolutions
            | TranscodeError::UnsupportedResolution(_)
            | TranscodeError::EmptyTaskId => code::BAD_REQUEST,
            TranscodeError::FileNotFound | TranscodeError::TaskNotFound(_) => code::NOT_FOUND,
            TranscodeError::QueueFull
            | TranscodeError::QueueClosed
            | TranscodeError::Json(_)
            | TranscodeError::Meta(_) => code::INTERNAL,
        }
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to launch {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{bin} exited with {status}: {stderr}")]
    Failed {
        bin: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("could not parse probe output: {0:?}")]
    BadProbeOutput(String),
}

fn stderr_tail(stderr: &[u8]) -> String {
    let tail = &stderr[stderr.len().saturating_sub(2048)..];
    String::from_utf8_lossy(tail).into_owned()
}

/// The external encoder pair. Both binaries are sub-processes with a fixed
/// CLI; stdout/stderr are captured and a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct Encoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Encoder {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
        }
    }

    /// Transcodes `source` into `target` at the given rendition: scale
    /// filter, preset bitrate, H.264 video and AAC audio, overwriting any
    /// previous output.
    pub async fn encode(
        &self,
        source: &Path,
        target: &Path,
        resolution: Resolution,
    ) -> Result<(), EncoderError> {
        let (width, height) = resolution.scale();
        let output = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(source)
            .args(["-vf", &format!("scale={width}:{height}")])
            .args(["-b:v", resolution.bitrate()])
            .args(["-c:v", "libx264", "-c:a", "aac", "-y"])
            .arg(target)
            .output()
            .await
            .map_err(|source| EncoderError::Spawn {
                bin: self.ffmpeg.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(EncoderError::Failed {
                bin: self.ffmpeg.display().to_string(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }

    /// Reads `width,height` of the first video stream from the probe binary.
    pub async fn probe_resolution(&self, source: &Path) -> Result<(u16, u16), EncoderError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=p=0",
            ])
            .arg(source)
            .output()
            .await
            .map_err(|source| EncoderError::Spawn {
                bin: self.ffprobe.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(EncoderError::Failed {
                bin: self.ffprobe.display().to_string(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        let (width, height) = line
            .split_once(',')
            .ok_or_else(|| EncoderError::BadProbeOutput(line.to_string()))?;
        match (width.trim().parse(), height.trim().parse()) {
            (Ok(w), Ok(h)) => Ok((w, h)),
            _ => Err(EncoderError::BadProbeOutput(line.to_string())),
        }
    }
}

/// Producer side of the bounded task queue. Enqueue never blocks: a full
/// queue is reported to the caller while the task row stays `pending` for a
/// later rehydration pass. [`close`](Self::close) seals the queue at
/// shutdown; workers finish the queued backlog and exit.
pub struct TranscoderHandle {
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
}

impl TranscoderHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: parking_lot::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn enqueue(&self, task_id: &str) -> TranscodeResult<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TranscodeError::QueueClosed);
        };
        tx.try_send(task_id.to_string()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TranscodeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TranscodeError::QueueClosed,
        })
    }

    /// Drops the sender. Workers consume whatever is already queued, then
    /// see a closed channel and exit; new enqueues report `QueueClosed`.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Task creation and status queries; the worker side lives in
/// [`spawn_workers`].
pub struct TranscodeService {
    state: Arc<ReelState>,
}

impl TranscodeService {
    pub fn new(state: Arc<ReelState>) -> Self {
        Self { state }
    }

    /// Validates the resolution list as a whole (no partial enqueue),
    /// replays by request-id, then records and enqueues the task.
    pub async fn create_task(
        &self,
        user: &str,
        file_hash: &str,
        resolutions: &[String],
        request_id: &str,
    ) -> TranscodeResult<String> {
        if !is_valid_file_hash(file_hash) {
            return Err(TranscodeError::InvalidHash);
        }
        if resolutions.is_empty() {
            return Err(TranscodeError::EmptyResolutions);
        }
        let mut parsed = Vec::with_capacity(resolutions.len());
        for name in resolutions {
            parsed.push(
                Resolution::parse(name)
                    .ok_or_else(|| TranscodeError::UnsupportedResolution(name.clone()))?,
            );
        }
        if !request_id.is_empty()
            && let Some(existing) = self.state.db.tasks().find_by_request_id(request_id).await?
        {
            tracing::info!(%request_id, task = %existing.task_id, "transcode replayed from request id");
            return Ok(existing.task_id);
        }
        if self.state.db.files().find(file_hash, user).await?.is_none() {
            return Err(TranscodeError::FileNotFound);
        }
        let task_id = Uuid::new_v4().to_string();
        let resolutions_json = serde_json::to_string(&parsed)?;
        match self
            .state
            .db
            .tasks()
            .create(NewTask {
                task_id: &task_id,
                file_hash,
                user_id: user,
                resolutions_json: &resolutions_json,
                request_id,
            })
            .await
        {
            Ok(()) => {}
            // Lost a request-id race: surface the winner's task instead.
            Err(DataBaseError::AlreadyExists { .. }) if !request_id.is_empty() => {
                if let Some(existing) =
                    self.state.db.tasks().find_by_request_id(request_id).await?
                {
                    return Ok(existing.task_id);
                }
                return Err(TranscodeError::TaskNotFound(request_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        self.state.transcoder.enqueue(&task_id)?;
        tracing::info!(task = %task_id, %file_hash, ?resolutions, "transcode task created");
        Ok(task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> TranscodeResult<TaskRecord> {
        if task_id.is_empty() {
            return Err(TranscodeError::EmptyTaskId);
        }
        self.state
            .db
            .tasks()
            .find_by_task_id(task_id)
            .await?
            .ok_or_else(|| TranscodeError::TaskNotFound(task_id.to_string()))
    }
}

/// Re-enqueues tasks that were still `pending` when the previous process
/// died. Terminal tasks never reach the queue, and a worker re-checks task
/// state on dequeue, so duplicates are harmless.
pub async fn rehydrate(state: &Arc<ReelState>) -> TranscodeResult<usize> {
    let limit = state.config.transcode.queue_capacity as u32;
    let pending = state.db.tasks().pending(limit).await?;
    let mut requeued = 0;
    for task in &pending {
        match state.transcoder.enqueue(&task.task_id) {
            Ok(()) => requeued += 1,
            Err(TranscodeError::QueueFull) => {
                tracing::warn!(task = %task.task_id, "queue full during rehydration, stopping");
                break;
            }
            Err(err) => {
                tracing::warn!(task = %task.task_id, error = %err, "failed to rehydrate task");
                break;
            }
        }
    }
    if requeued > 0 {
        tracing::info!(requeued, "rehydrated pending transcode tasks");
    }
    Ok(requeued)
}

/// Spawns `workers` long-lived consumers over one shared receiver and hands
/// back their join handles so shutdown can wait for in-flight renditions.
/// The number of live encoder sub-processes never exceeds `workers`.
pub fn spawn_workers(
    state: Arc<ReelState>,
    rx: mpsc::Receiver<String>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let state = state.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                worker_loop(worker, state, rx).await;
            })
        })
        .collect()
}

async fn worker_loop(worker: usize, state: Arc<ReelState>, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
    loop {
        let task_id = { rx.lock().await.recv().await };
        let Some(task_id) = task_id else {
            tracing::info!(worker, "task queue closed, worker exiting");
            return;
        };
        tracing::info!(worker, task = %task_id, "transcode task dequeued");
        if let Err(err) = process_task(&state, &task_id).await {
            tracing::error!(worker, task = %task_id, error = %err, "transcode task failed");
            if let Err(err) = state
                .db
                .tasks()
                .update_progress(&task_id, TranscodeStatus::Failed, 0, None)
                .await
            {
                tracing::error!(task = %task_id, error = %err, "failed to mark task failed");
            }
        }
    }
}

/// One task, one worker: every requested rendition is attempted, per-
/// rendition failures are logged and skipped, progress and partial results
/// are persisted after each attempt. `failed` only when nothing succeeded.
async fn process_task(state: &Arc<ReelState>, task_id: &str) -> TranscodeResult<()> {
    let tasks = state.db.tasks();
    let task = tasks
        .find_by_task_id(task_id)
        .await?
        .ok_or_else(|| TranscodeError::TaskNotFound(task_id.to_string()))?;
    if task.status.is_terminal() {
        tracing::debug!(task = %task_id, status = ?task.status, "task already terminal, skipping");
        return Ok(());
    }
    tasks
        .update_progress(task_id, TranscodeStatus::Processing, 0, None)
        .await?;

    let file = state
        .db
        .files()
        .find(&task.file_hash, &task.user_id)
        .await?
        .ok_or(TranscodeError::FileNotFound)?;
    let source = state
        .store
        .blob_path(&task.user_id, &task.file_hash, &file.filename);
    if tokio::fs::metadata(&source).await.is_err() {
        tracing::error!(task = %task_id, source = %source.display(), "source blob missing");
        return Err(TranscodeError::FileNotFound);
    }

    let names: Vec<String> = serde_json::from_str(&task.resolutions)?;
    let ext = file_ext(&file.filename);
    let total = names.len().max(1);
    let mut completed: Vec<String> = Vec::new();
    for (attempted, name) in names.iter().enumerate() {
        if let Some(resolution) = Resolution::parse(name) {
            let target = state.store.output_path(&task.file_hash, resolution, &ext);
            match state.encoder.encode(&source, &target, resolution).await {
                Ok(()) => {
                    completed.push(crate::services::chunk_store::ChunkStore::output_url(
                        &task.file_hash,
                        resolution,
                        &ext,
                    ));
                }
                Err(err) => {
                    tracing::warn!(task = %task_id, %resolution, error = %err, "rendition failed, continuing");
                }
            }
        } else {
            tracing::warn!(task = %task_id, %name, "unknown rendition in stored task, skipping");
        }
        let progress = ((attempted + 1) * 100 / total) as i32;
        let urls_json = serde_json::to_string(&completed)?;
        tasks
            .update_progress(task_id, TranscodeStatus::Processing, progress, Some(&urls_json))
            .await?;
    }

    let status = if completed.is_empty() {
        TranscodeStatus::Failed
    } else {
        TranscodeStatus::Completed
    };
    let urls_json = serde_json::to_string(&completed)?;
    tasks
        .update_progress(task_id, status, 100, Some(&urls_json))
        .await?;
    state
        .db
        .files()
        .set_transcode_state(&task.file_hash, &task.user_id, status, &urls_json)
        .await?;
    tracing::info!(task = %task_id, ?status, renditions = completed.len(), "transcode task finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::states::testing::{self, TestEnv};
    use crate::services::upload::UploadService;
    use std::time::Duration;

    const HASH: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn seed_file(env: &TestEnv, user: &str) {
        let svc = UploadService::new(env.state.clone());
        svc.init_upload(user, HASH, "").await.unwrap();
        svc.upload_chunk(user, HASH, "0", b"fake video payload").await.unwrap();
        svc.merge_file(user, HASH, "v.mp4", 1, 0, 0, "").await.unwrap();
    }

    #[cfg(unix)]
    async fn install_stub_encoder(env: &TestEnv, script_body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = env.state.config.transcode.ffmpeg.clone();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, script_body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
    }

    async fn wait_terminal(svc: &TranscodeService, task_id: &str) -> TaskRecord {
        for _ in 0..500 {
            let task = svc.task_status(task_id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn rejects_unknown_resolution_without_enqueue() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        let svc = TranscodeService::new(env.state.clone());
        let err = svc
            .create_task("u", HASH, &["720p".into(), "144p".into()], "")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedResolution(ref r) if r == "144p"));
        assert_eq!(err.code(), 400);
        // nothing was recorded or queued
        assert!(env.state.db.tasks().pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_file_and_empty_list() {
        let env = testing::env().await;
        let svc = TranscodeService::new(env.state.clone());
        assert!(matches!(
            svc.create_task("u", HASH, &["720p".into()], "").await.unwrap_err(),
            TranscodeError::FileNotFound
        ));
        assert!(matches!(
            svc.create_task("u", HASH, &[], "").await.unwrap_err(),
            TranscodeError::EmptyResolutions
        ));
    }

    #[tokio::test]
    async fn request_id_returns_same_task() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        let svc = TranscodeService::new(env.state.clone());
        let first = svc
            .create_task("u", HASH, &["720p".into()], "T1")
            .await
            .unwrap();
        let second = svc
            .create_task("u", HASH, &["720p".into()], "T1")
            .await
            .unwrap();
        assert_eq!(first, second);
        // only the first call enqueued
        let mut rx = env.task_rx;
        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_rejects_with_queue_full() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        let svc = TranscodeService::new(env.state.clone());
        // test capacity is 4; the receiver is not being drained
        for _ in 0..4 {
            svc.create_task("u", HASH, &["360p".into()], "").await.unwrap();
        }
        let err = svc.create_task("u", HASH, &["360p".into()], "").await.unwrap_err();
        assert!(matches!(err, TranscodeError::QueueFull));
        assert_eq!(err.code(), 500);
        // the rejected task stays pending for the next rehydration
        assert_eq!(env.state.db.tasks().pending(10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn rehydrate_requeues_only_pending() {
        let env = testing::env().await;
        env.state
            .db
            .tasks()
            .create(NewTask {
                task_id: "t-pending",
                file_hash: HASH,
                user_id: "u",
                resolutions_json: "[\"360p\"]",
                request_id: "",
            })
            .await
            .unwrap();
        env.state
            .db
            .tasks()
            .create(NewTask {
                task_id: "t-done",
                file_hash: HASH,
                user_id: "u",
                resolutions_json: "[\"360p\"]",
                request_id: "",
            })
            .await
            .unwrap();
        env.state
            .db
            .tasks()
            .update_progress("t-done", TranscodeStatus::Completed, 100, None)
            .await
            .unwrap();
        assert_eq!(rehydrate(&env.state).await.unwrap(), 1);
        let mut rx = env.task_rx;
        assert_eq!(rx.try_recv().unwrap(), "t-pending");
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_completes_task_with_stub_encoder() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        // the stub copies the source (after -i) to the last argument
        install_stub_encoder(
            &env,
            "#!/bin/sh\nfor last; do :; done\ncp \"$2\" \"$last\"\n",
        )
        .await;
        let svc = TranscodeService::new(env.state.clone());
        spawn_workers(env.state.clone(), env.task_rx, 1);
        let task_id = svc
            .create_task("u", HASH, &["720p".into(), "480p".into()], "")
            .await
            .unwrap();
        let task = wait_terminal(&svc, &task_id).await;
        assert_eq!(task.status, TranscodeStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(
            task.result_url_list(),
            vec![
                format!("/files/{HASH}_720p.mp4"),
                format!("/files/{HASH}_480p.mp4"),
            ]
        );
        for resolution in [Resolution::P720, Resolution::P480] {
            let out = env.state.store.output_path(HASH, resolution, ".mp4");
            assert_eq!(
                tokio::fs::read(out).await.unwrap(),
                b"fake video payload"
            );
        }
        // terminal state is mirrored onto the file row
        let file = env.state.db.files().find(HASH, "u").await.unwrap().unwrap();
        assert_eq!(file.transcode_status, TranscodeStatus::Completed);
        assert_eq!(file.transcode_url_list().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_renditions_failing_marks_task_failed() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        install_stub_encoder(&env, "#!/bin/sh\nexit 1\n").await;
        let svc = TranscodeService::new(env.state.clone());
        spawn_workers(env.state.clone(), env.task_rx, 1);
        let task_id = svc
            .create_task("u", HASH, &["1080p".into()], "")
            .await
            .unwrap();
        let task = wait_terminal(&svc, &task_id).await;
        assert_eq!(task.status, TranscodeStatus::Failed);
        assert_eq!(task.progress, 100);
        assert!(task.result_url_list().is_empty());
        let file = env.state.db.files().find(HASH, "u").await.unwrap().unwrap();
        assert_eq!(file.transcode_status, TranscodeStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn partial_success_still_completes() {
        let env = testing::env().await;
        seed_file(&env, "u").await;
        // fail only the 1080p rendition (scale filter mentions 1920)
        install_stub_encoder(
            &env,
            "#!/bin/sh\ncase \"$4\" in *1920*) exit 1;; esac\nfor last; do :; done\ncp \"$2\" \"$last\"\n",
        )
        .await;
        let svc = TranscodeService::new(env.state.clone());
        spawn_workers(env.state.clone(), env.task_rx, 1);
        let task_id = svc
            .create_task("u", HASH, &["1080p".into(), "360p".into()], "")
            .await
            .unwrap();
        let task = wait_terminal(&svc, &task_id).await;
        assert_eq!(task.status, TranscodeStatus::Completed);
        assert_eq!(task.result_url_list(), vec![format!("/files/{HASH}_360p.mp4")]);
    }

    #[tokio::test]
    async fn closed_queue_drains_workers_and_rejects_new_work() {
        let env = testing::env().await;
        let workers = spawn_workers(env.state.clone(), env.task_rx, 2);
        env.state.transcoder.close();
        assert!(matches!(
            env.state.transcoder.enqueue("t-late"),
            Err(TranscodeError::QueueClosed)
        ));
        // with the sender gone, every worker sees a closed channel and exits
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn worker_skips_terminal_task() {
        let env = testing::env().await;
        env.state
            .db
            .tasks()
            .create(NewTask {
                task_id: "t-done",
                file_hash: HASH,
                user_id: "u",
                resolutions_json: "[\"360p\"]",
                request_id: "",
            })
            .await
            .unwrap();
        env.state
            .db
            .tasks()
            .update_progress("t-done", TranscodeStatus::Completed, 100, Some("[\"/files/x.mp4\"]"))
            .await
            .unwrap();
        // a duplicate enqueue of a finished task must not disturb its state
        process_task(&env.state, "t-done").await.unwrap();
        let task = env
            .state
            .db
            .tasks()
            .find_by_task_id("t-done")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TranscodeStatus::Completed);
        assert_eq!(task.result_url_list(), vec!["/files/x.mp4"]);
    }
}
