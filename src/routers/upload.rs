use crate::layers::principal::Principal;
use crate::models::api::prelude::*;
use crate::models::video::FileStatus;
use crate::routers::VideoRouterState;
use crate::services::upload::InitUploadOutcome;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub file_hash: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct InitUploadResp {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_chunks: Option<Vec<String>>,
}

pub async fn init_upload(
    principal: Principal,
    State((upload, _, _)): VideoRouterState,
    Json(req): Json<InitUploadReq>,
) -> Json<InitUploadResp> {
    let user = principal.resolve(&req.user_id);
    tracing::debug!(%user, file_hash = %req.file_hash, filename = %req.filename, "init upload");
    let resp = match upload
        .init_upload(&user, &req.file_hash, &req.request_id)
        .await
    {
        Ok(InitUploadOutcome::Existing { status, url, replayed }) => InitUploadResp {
            code: code::OK,
            msg: if replayed {
                "request already processed".into()
            } else {
                "file already exists".into()
            },
            status: Some(status),
            url: Some(url),
            finished_chunks: None,
        },
        Ok(InitUploadOutcome::Resumed { finished_chunks }) => InitUploadResp {
            code: code::OK,
            msg: "resuming upload".into(),
            status: Some(FileStatus::Uploading),
            url: None,
            finished_chunks: Some(finished_chunks),
        },
        Ok(InitUploadOutcome::Fresh) => InitUploadResp {
            code: code::OK,
            msg: "upload initialized".into(),
            status: Some(FileStatus::Uploading),
            url: None,
            finished_chunks: Some(Vec::new()),
        },
        Err(err) => InitUploadResp::from_err(&err),
    };
    Json(resp)
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct UploadChunkReq {
    pub file_hash: String,
    pub index: String,
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct UploadChunkResp {
    pub code: i32,
    pub msg: String,
}

pub async fn upload_chunk(
    principal: Principal,
    State((upload, _, _)): VideoRouterState,
    Json(req): Json<UploadChunkReq>,
) -> Json<UploadChunkResp> {
    let user = principal.resolve(&req.user_id);
    let resp = match upload
        .upload_chunk(&user, &req.file_hash, &req.index, &req.data)
        .await
    {
        Ok(()) => UploadChunkResp {
            code: code::OK,
            msg: "chunk uploaded".into(),
        },
        Err(err) => UploadChunkResp::from_err(&err),
    };
    Json(resp)
}

#[derive(Debug, Deserialize)]
pub struct MergeFileReq {
    pub file_hash: String,
    pub filename: String,
    pub total_chunks: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct MergeFileResp {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

pub async fn merge_file(
    principal: Principal,
    State((upload, _, _)): VideoRouterState,
    Json(req): Json<MergeFileReq>,
) -> Json<MergeFileResp> {
    let user = principal.resolve(&req.user_id);
    // a non-positive count never reaches the coordinator
    let total_chunks = u32::try_from(req.total_chunks).unwrap_or(0);
    let resp = match upload
        .merge_file(
            &user,
            &req.file_hash,
            &req.filename,
            total_chunks,
            req.width,
            req.height,
            &req.request_id,
        )
        .await
    {
        Ok(outcome) => MergeFileResp {
            code: code::OK,
            msg: "file merged".into(),
            url: Some(outcome.url),
        },
        Err(err) => MergeFileResp::from_err(&err),
    };
    Json(resp)
}

impl_failure_resp!(InitUploadResp, UploadChunkResp, MergeFileResp);
