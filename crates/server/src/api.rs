//! Upload and delete endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use http_body_util::LengthLimitError;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use url::Url;

use uploader::layout::is_valid_token;
use uploader::{Job, TranscodePipeline};

use crate::auth::{AuthUser, Authenticator};
use crate::error::{ApiError, ApiResult};

/// Multipart part that carries the video
const VIDEO_PART: &str = "video";

static REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: TranscodePipeline,
    pub auth: Arc<dyn Authenticator>,
}

/// Build the API router
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/uploads", post(upload))
        .route("/uploads/:token", delete(delete_upload))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(cors_layer())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let id = REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1;
    info!("request-{}: {} {}", id, request.method(), request.uri().path());

    let response = next.run(request).await;

    info!("request-{}: {}", id, response.status());
    response
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    redirect_to: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    video: String,
    thumbnail: String,
    delete_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

/// `POST /uploads`
///
/// Accepts the video as the raw body or as the `video` part of a multipart
/// form, queues it for transcoding and answers with the URLs it will be
/// served at.
async fn upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<UploadParams>,
    request: Request,
) -> ApiResult<Response> {
    let redirect = params
        .redirect_to
        .filter(|r| !r.is_empty())
        .map(|r| Url::parse(&r).map_err(|e| ApiError::bad_request(format!("Invalid redirect_to: {}", e))))
        .transpose()?;

    let pipeline = &state.pipeline;
    let job = pipeline.reserve(&user)?;

    let title = match receive_upload(&state, &job, request).await {
        Ok(title) => title,
        Err(e) => {
            pipeline.release(&job);
            return Err(e);
        }
    };

    if let Err(e) = pipeline.commit_source(&job) {
        pipeline.release(&job);
        return Err(e.into());
    }

    pipeline.admit(job.clone())?;

    match redirect {
        Some(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("video_url", &job.video_url)
                    .append_pair("thumb_url", &job.thumbnail_url)
                    .append_pair("delete_url", &job.delete_url);
                if let Some(title) = &title {
                    query.append_pair("title", title);
                }
            }
            Ok((StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response())
        }
        None => Ok(Json(UploadResponse {
            video: job.video_url,
            thumbnail: job.thumbnail_url,
            delete_url: job.delete_url,
            title,
        })
        .into_response()),
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false)
}

/// Stream the request body into the job's download file
///
/// Returns the multipart file name, if there was one.
async fn receive_upload(state: &AppState, job: &Job, request: Request) -> ApiResult<Option<String>> {
    let source = job.source_path.display().to_string();
    let mut file = File::create(&job.download_path).await?;

    let title = if is_multipart(request.headers()) {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

        let mut title = None;
        let mut found = false;

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(multipart_error)?
        {
            if field.name() != Some(VIDEO_PART) {
                continue;
            }

            title = field.file_name().filter(|n| !n.is_empty()).map(str::to_string);
            info!(
                "{}: Downloading {}={} ({})",
                source,
                VIDEO_PART,
                title.as_deref().unwrap_or(""),
                field.content_type().unwrap_or("")
            );

            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(multipart_error)?
            {
                file.write_all(&chunk).await?;
            }
            found = true;
        }

        if !found {
            return Err(ApiError::bad_request("'video' not found in multipart data"));
        }
        title
    } else {
        info!("{}: Downloading raw body data", source);

        let mut body = request.into_body().into_data_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(body_error)?;
            file.write_all(&chunk).await?;
        }
        None
    };

    file.flush().await?;
    file.sync_all().await?;
    Ok(title)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::bad_request(err.body_text())
    }
}

fn body_error(err: axum::Error) -> ApiError {
    if exceeds_length_limit(&err) {
        ApiError::PayloadTooLarge(format!("Upload exceeds the size limit: {}", err))
    } else {
        ApiError::bad_request(format!("Failed to read body: {}", err))
    }
}

/// Whether the body limit layer cut the stream short
fn exceeds_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// `DELETE /uploads/:token`
async fn delete_upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(token): Path<String>,
) -> ApiResult<StatusCode> {
    if !is_valid_token(&token) {
        return Err(ApiError::bad_request(format!("Invalid upload token {:?}", token)));
    }

    state.pipeline.remove_upload(&token, &user)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path as FsPath;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use http_body_util::{BodyExt, Limited};
    use tempfile::TempDir;
    use tokio::sync::{oneshot, Notify};
    use tower::ServiceExt;

    use uploader::transcode::{MediaTool, ToolError, TranscodeOptions};
    use uploader::{Layout, OwnershipStore, Rotation, WorkerPool};

    use crate::auth::{AuthError, Credentials};

    /// Accepts `Bearer <user>` and uses the bare user name as the id
    struct StubAuth;

    #[async_trait]
    impl Authenticator for StubAuth {
        async fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError> {
            credentials
                .authorization
                .as_deref()
                .and_then(|a| a.strip_prefix("Bearer "))
                .map(str::to_string)
                .ok_or(AuthError::Status(401))
        }
    }

    /// Fails every step, so jobs run straight through to source removal
    struct FailingTool;

    fn unavailable() -> ToolError {
        ToolError::Failed {
            tool: "stub".to_string(),
            exit_code: 1,
            stderr: "unavailable".to_string(),
        }
    }

    #[async_trait]
    impl MediaTool for FailingTool {
        async fn extract_rotation(&self, _src: &FsPath) -> Result<Rotation, ToolError> {
            Err(unavailable())
        }

        async fn extract_duration(&self, _src: &FsPath) -> Result<f64, ToolError> {
            Err(unavailable())
        }

        async fn transcode(
            &self,
            _src: &FsPath,
            _dst: &FsPath,
            _options: &TranscodeOptions,
        ) -> Result<(), ToolError> {
            Err(unavailable())
        }

        async fn generate_thumbnail(
            &self,
            _src: &FsPath,
            _dst: &FsPath,
            _at_secs: f64,
            _rotation: Rotation,
        ) -> Result<(), ToolError> {
            Err(unavailable())
        }
    }

    struct TestApp {
        _dir: TempDir,
        layout: Layout,
        pipeline: TranscodePipeline,
        router: Router,
    }

    fn test_app(fast_capacity: usize) -> TestApp {
        test_app_with_limit(fast_capacity, 1024 * 1024)
    }

    fn test_app_with_limit(fast_capacity: usize, max_upload_bytes: usize) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout {
            temp_dir: dir.path().join("temp"),
            serve_dir: dir.path().join("serve"),
            video_extension: "mp4".to_string(),
            storage_url: "http://localhost/storage".to_string(),
            api_url: "http://localhost".to_string(),
        };
        fs::create_dir_all(&layout.temp_dir).unwrap();
        fs::create_dir_all(&layout.serve_dir).unwrap();

        let pipeline = TranscodePipeline::new(
            layout.clone(),
            Arc::new(OwnershipStore::new()),
            Arc::new(FailingTool),
            WorkerPool::new("fast", 1, fast_capacity),
            WorkerPool::new("slow", 1, 16),
        );
        let state = AppState {
            pipeline: pipeline.clone(),
            auth: Arc::new(StubAuth),
        };

        TestApp {
            _dir: dir,
            layout,
            pipeline,
            router: router(state, max_upload_bytes),
        }
    }

    fn raw_upload(uri: &str, user: &str, body: &'static str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("Authorization", format!("Bearer {}", user))
            .header("Content-Type", "video/mp4")
            .body(Body::from(body))
            .unwrap()
    }

    fn multipart_upload(part_name: &str, file_name: &str) -> HttpRequest<Body> {
        let body = format!(
            "--XBOUNDARY\r\n\
             Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: video/quicktime\r\n\r\n\
             raw-bytes\r\n\
             --XBOUNDARY--\r\n",
            part_name, file_name
        );
        HttpRequest::builder()
            .method("POST")
            .uri("/uploads")
            .header("Authorization", "Bearer alice")
            .header("Content-Type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap()
    }

    fn delete_request(token: &str, user: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("DELETE")
            .uri(format!("/uploads/{}", token))
            .header("Authorization", format!("Bearer {}", user))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn token_of(url: &str) -> String {
        url.rsplit('/').next().unwrap().trim_end_matches(".mp4").to_string()
    }

    fn serve_dir_is_empty(layout: &Layout) -> bool {
        fs::read_dir(&layout.serve_dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_upload_requires_authentication() {
        let app = test_app(16);
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/uploads")
            .body(Body::from("raw"))
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(serve_dir_is_empty(&app.layout));
    }

    #[tokio::test]
    async fn test_raw_upload_returns_urls_and_reserves_for_user() {
        let app = test_app(16);

        let response = app.router.oneshot(raw_upload("/uploads", "alice", "raw")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        let video = json["video"].as_str().unwrap();
        assert!(video.starts_with("http://localhost/storage/video-"));
        assert!(video.ends_with(".mp4"));
        assert!(json["thumbnail"].as_str().unwrap().ends_with(".jpg"));
        assert!(json.get("title").is_none());

        let token = token_of(video);
        assert_eq!(json["deleteUrl"], format!("http://localhost/uploads/{}", token));
        assert_eq!(
            app.pipeline.store().read_owner(&app.layout.serve_video_path(&token)).unwrap(),
            "alice"
        );
    }

    #[tokio::test]
    async fn test_multipart_upload_uses_file_name_as_title() {
        let app = test_app(16);

        let response = app.router.oneshot(multipart_upload("video", "cat.mov")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["title"], "cat.mov");
    }

    #[tokio::test]
    async fn test_multipart_without_video_part_is_rejected() {
        let app = test_app(16);

        let response = app.router.oneshot(multipart_upload("image", "cat.jpg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "'video' not found in multipart data");

        // Reservation and partial download are released
        assert!(serve_dir_is_empty(&app.layout));
        assert!(fs::read_dir(&app.layout.temp_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_oversized_raw_body_is_rejected() {
        let app = test_app_with_limit(16, 8);
        let chunks = futures_util::stream::iter(["0123456", "789abcd"].map(Ok::<_, std::io::Error>));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/uploads")
            .header("Authorization", "Bearer alice")
            .body(Body::from_stream(chunks))
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(serve_dir_is_empty(&app.layout));
        assert!(fs::read_dir(&app.layout.temp_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_oversized_multipart_is_rejected() {
        let app = test_app_with_limit(16, 64);

        let response = app.router.oneshot(multipart_upload("video", "cat.mov")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(serve_dir_is_empty(&app.layout));
    }

    #[tokio::test]
    async fn test_length_limit_is_found_in_error_chain() {
        let limited = Limited::new(String::from("0123456789"), 4);
        let err = axum::Error::new(limited.collect().await.unwrap_err());
        assert!(exceeds_length_limit(&err));

        let err = axum::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "reset"));
        assert!(!exceeds_length_limit(&err));
    }

    #[tokio::test]
    async fn test_redirect_carries_urls_in_query() {
        let app = test_app(16);
        let uri = "/uploads?redirect_to=http%3A%2F%2Fapp.example%2Fdone%3Fx%3D1";

        let response = app.router.oneshot(raw_upload(uri, "alice", "raw")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let location = response.headers()[header::LOCATION].to_str().unwrap();
        let url = Url::parse(location).unwrap();
        assert_eq!(url.host_str(), Some("app.example"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["x", "video_url", "thumb_url", "delete_url"]);
        assert!(pairs[1].1.starts_with("http://localhost/storage/video-"));
    }

    #[tokio::test]
    async fn test_bad_redirect_is_rejected_before_reserving() {
        let app = test_app(16);

        let response = app
            .router
            .oneshot(raw_upload("/uploads?redirect_to=not%20a%20url", "alice", "raw"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(serve_dir_is_empty(&app.layout));
    }

    #[tokio::test]
    async fn test_full_queue_answers_unavailable() {
        let app = test_app(1);

        // Hold the only fast worker and fill the one queue slot
        let release = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();
        let wait_for = Arc::clone(&release);
        app.pipeline
            .fast_pool()
            .add_blocking(Box::pin(async move {
                let _ = started_tx.send(());
                wait_for.notified().await;
            }))
            .await;
        started_rx.await.unwrap();
        assert!(app.pipeline.fast_pool().add_if_space(Box::pin(async {})));

        let response = app.router.clone().oneshot(raw_upload("/uploads", "alice", "raw")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "process queue full");
        assert!(serve_dir_is_empty(&app.layout));

        release.notify_one();
    }

    #[tokio::test]
    async fn test_delete_checks_owner() {
        let app = test_app(16);
        let response = app.router.clone().oneshot(raw_upload("/uploads", "alice", "raw")).await.unwrap();
        let token = token_of(json_body(response).await["video"].as_str().unwrap());

        let response = app.router.clone().oneshot(delete_request(&token, "bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.router.clone().oneshot(delete_request(&token, "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(app
            .pipeline
            .store()
            .read_owner(&app.layout.serve_video_path(&token))
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_unknown_upload_fails() {
        let app = test_app(16);

        let response = app.router.clone().oneshot(delete_request("video-missing", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app.router.oneshot(delete_request("..%2Fetc", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let app = test_app(16);
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/uploads")
            .header("Origin", "http://app.example")
            .header("Access-Control-Request-Method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
