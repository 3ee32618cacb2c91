use crate::layers::principal::principal_context;
use crate::routers::upload::{init_upload, merge_file, upload_chunk};
use crate::routers::video::{
    create_transcode, download_chunk, get_transcode_status, get_video_info,
};
use crate::services::read::ReadService;
use crate::services::states::ReelState;
use crate::services::transcoder::TranscodeService;
use crate::services::upload::UploadService;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderName, Request};
use axum::routing::{post, put};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info_span;

mod upload;
mod video;

pub type VideoRouterState = State<(
    Arc<UploadService>,
    Arc<TranscodeService>,
    Arc<ReadService>,
)>;

pub async fn router(state: Arc<ReelState>) -> Router {
    let upload_service = Arc::new(UploadService::new(state.clone()));
    let transcode_service = Arc::new(TranscodeService::new(state.clone()));
    let read_service = Arc::new(ReadService::new(state.clone()));
    let video_router = {
        Router::new()
            .nest(
                "/upload",
                Router::new()
                    .route("/init", post(init_upload))
                    .route("/chunk", put(upload_chunk))
                    .route("/merge", post(merge_file)),
            )
            .route("/download", post(download_chunk))
            .route("/info", post(get_video_info))
            .route("/transcode", post(create_transcode))
            .route("/transcode/status", post(get_transcode_status))
            .layer(axum::middleware::from_fn(principal_context))
            .with_state((upload_service, transcode_service, read_service))
    };
    let trace_header = HeaderName::from_static("x-request-id");
    Router::new()
        .nest("/api/v1/video", video_router)
        .nest_service(
            "/files",
            ServeDir::new(state.config.storage.root.join("files")),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    trace_header.clone(),
                    MakeRequestUuid,
                ))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
                        let rid = req
                            .extensions()
                            .get::<RequestId>()
                            .and_then(|r| r.header_value().to_str().ok())
                            .unwrap_or("unknown");
                        info_span!(
                            "http.request",
                            request_id = %rid,
                            method = %req.method(),
                            uri = %req.uri(),
                            version = ?req.version(),
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::new(trace_header))
                .concurrency_limit(state.config.common.concurrency_limit),
        )
}
