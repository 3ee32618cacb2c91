use crate::layers::principal::Principal;
use crate::models::api::prelude::*;
use crate::models::video::TranscodeStatus;
use crate::routers::VideoRouterState;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

#[derive(Debug, Deserialize)]
pub struct DownloadChunkReq {
    pub file_hash: String,
    #[serde(default)]
    pub start_byte: i64,
    #[serde(default)]
    pub end_byte: i64,
}

#[serde_as]
#[derive(Debug, Default, Serialize)]
pub struct DownloadChunkResp {
    pub code: i32,
    pub msg: String,
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    pub total_size: i64,
}

pub async fn download_chunk(
    principal: Principal,
    State((_, _, read)): VideoRouterState,
    Json(req): Json<DownloadChunkReq>,
) -> Json<DownloadChunkResp> {
    let user = principal.resolve("");
    let resp = match read
        .download_chunk(&user, &req.file_hash, req.start_byte, req.end_byte)
        .await
    {
        Ok((data, total_size)) => DownloadChunkResp {
            code: code::OK,
            msg: "range read".into(),
            data,
            total_size,
        },
        Err(err) => DownloadChunkResp::from_err(&err),
    };
    Json(resp)
}

#[derive(Debug, Deserialize)]
pub struct GetVideoInfoReq {
    pub file_hash: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct GetVideoInfoResp {
    pub code: i32,
    pub msg: String,
    pub file_hash: String,
    pub filename: String,
    pub file_size: i64,
    pub width: u16,
    pub height: u16,
    pub url: String,
    pub transcode_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_status: Option<TranscodeStatus>,
}

pub async fn get_video_info(
    principal: Principal,
    State((_, _, read)): VideoRouterState,
    Json(req): Json<GetVideoInfoReq>,
) -> Json<GetVideoInfoResp> {
    let user = principal.resolve(&req.user_id);
    let resp = match read.get_video_info(&user, &req.file_hash).await {
        Ok(file) => GetVideoInfoResp {
            code: code::OK,
            msg: "ok".into(),
            file_hash: file.file_hash.clone(),
            filename: file.filename.clone(),
            file_size: file.file_size,
            width: file.width,
            height: file.height,
            url: file.url.clone(),
            transcode_urls: file.transcode_url_list(),
            transcode_status: Some(file.transcode_status),
        },
        Err(err) => GetVideoInfoResp::from_err(&err),
    };
    Json(resp)
}

#[derive(Debug, Deserialize)]
pub struct TranscodeReq {
    pub file_hash: String,
    pub resolutions: Vec<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct TranscodeResp {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

pub async fn create_transcode(
    principal: Principal,
    State((_, transcode, _)): VideoRouterState,
    Json(req): Json<TranscodeReq>,
) -> Json<TranscodeResp> {
    let user = principal.resolve(&req.user_id);
    let resp = match transcode
        .create_task(&user, &req.file_hash, &req.resolutions, &req.request_id)
        .await
    {
        Ok(task_id) => TranscodeResp {
            code: code::OK,
            msg: "transcode task created".into(),
            task_id: Some(task_id),
        },
        Err(err) => TranscodeResp::from_err(&err),
    };
    Json(resp)
}

#[derive(Debug, Deserialize)]
pub struct GetTranscodeStatusReq {
    pub task_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct GetTranscodeStatusResp {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TranscodeStatus>,
    pub progress: i32,
    pub completed_urls: Vec<String>,
}

pub async fn get_transcode_status(
    State((_, transcode, _)): VideoRouterState,
    Json(req): Json<GetTranscodeStatusReq>,
) -> Json<GetTranscodeStatusResp> {
    let resp = match transcode.task_status(&req.task_id).await {
        Ok(task) => GetTranscodeStatusResp {
            code: code::OK,
            msg: "ok".into(),
            status: Some(task.status),
            progress: task.progress,
            completed_urls: task.result_url_list(),
        },
        Err(err) => GetTranscodeStatusResp::from_err(&err),
    };
    Json(resp)
}

impl_failure_resp!(
    DownloadChunkResp,
    GetVideoInfoResp,
    TranscodeResp,
    GetTranscodeStatusResp,
);
