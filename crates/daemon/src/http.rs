use std::future::Future;
use std::sync::Arc;
use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use crate::error::{ServiceError, ServiceResult};
use crate::job::{ConversionOptions, JobStatus};
use crate::service::{HealthReport, JobService, JobStatusView};
use crate::storage::StagedUpload;

/// Optional caller-chosen job id
pub const JOB_ID_HEADER: &str = "x-job-id";
/// Set on downloads when a background color was detected
pub const DETECTED_COLOR_HEADER: &str = "x-detected-color";
/// Allowance for multipart boundaries and the small text fields
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotReady { .. } | ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Storage(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        let body = match &self {
            ServiceError::NotReady { status, progress, error, .. } => ErrorBody {
                error: error.clone().unwrap_or_else(|| self.to_string()),
                status: Some(*status),
                progress: Some(*progress),
            },
            ServiceError::Storage(_) | ServiceError::Internal(_) => {
                error!("Request failed: {}", self);
                ErrorBody { error: self.to_string(), status: None, progress: None }
            }
            _ => ErrorBody { error: self.to_string(), status: None, progress: None },
        };

        (status_code, Json(body)).into_response()
    }
}

/// Build the HTTP router
pub fn router(service: Arc<JobService>) -> Router {
    let body_limit = service.config().max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/upload", post(upload))
        .route("/status/:id", get(status))
        .route("/download/:id", get(download))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::map_response(oversized_as_bad_request))
        .with_state(service)
}

/// The body limit answers 413 with a plain-text body. Report it like every
/// other rejected upload.
async fn oversized_as_bad_request(response: Response) -> Response {
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }
    ServiceError::Validation("upload exceeds the maximum allowed size".to_string()).into_response()
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn serve<F>(listener: TcpListener, service: Arc<JobService>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Default)]
struct UploadForm {
    file: Option<StagedUpload>,
    crf: Option<String>,
    audio_bitrate: Option<String>,
    detect_green: Option<String>,
}

fn bad_multipart(e: MultipartError) -> ServiceError {
    ServiceError::Validation(format!("malformed multipart body: {}", e))
}

async fn read_form(service: &JobService, multipart: &mut Multipart, form: &mut UploadForm) -> ServiceResult<()> {
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if form.file.is_some() {
                    return Err(ServiceError::Validation("only one file may be uploaded".to_string()));
                }
                form.file = Some(service.stage_upload(field).await?);
            }
            "crf" => form.crf = Some(field.text().await.map_err(bad_multipart)?),
            "audio_bitrate" => form.audio_bitrate = Some(field.text().await.map_err(bad_multipart)?),
            "detect_green" => form.detect_green = Some(field.text().await.map_err(bad_multipart)?),
            other => debug!("Ignoring form field {:?}", other),
        }
    }
    Ok(())
}

async fn upload(
    State(service): State<Arc<JobService>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadAccepted>, ServiceError> {
    let requested_id = match headers.get(JOB_ID_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ServiceError::Validation("X-Job-Id must be ASCII".to_string()))?
                .to_string(),
        ),
        None => None,
    };

    let mut form = UploadForm::default();
    if let Err(e) = read_form(&service, &mut multipart, &mut form).await {
        if let Some(staged) = &form.file {
            service.discard_upload(staged).await;
        }
        return Err(e);
    }

    let Some(staged) = form.file.take() else {
        return Err(ServiceError::Validation("missing \"file\" field".to_string()));
    };

    let options = match ConversionOptions::from_fields(
        form.crf.as_deref(),
        form.audio_bitrate.as_deref(),
        form.detect_green.as_deref(),
    ) {
        Ok(options) => options,
        Err(e) => {
            service.discard_upload(&staged).await;
            return Err(e);
        }
    };

    let job_id = service.submit_staged(staged, options, requested_id.as_deref()).await?;
    Ok(Json(UploadAccepted {
        job_id,
        status: JobStatus::Processing,
    }))
}

async fn status(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, ServiceError> {
    service.status(&id).map(Json)
}

async fn download(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let delivery = service.fetch_output(&id).await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/webm")
        .header(header::CONTENT_LENGTH, delivery.content_length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.webm\"", delivery.job_id),
        );
    if let Some(color) = &delivery.detected_color {
        builder = builder.header(DETECTED_COLOR_HEADER, color.as_str());
    }

    builder
        .body(Body::from_stream(delivery.stream))
        .map_err(|e| ServiceError::Internal(format!("failed to build download response: {}", e)))
}

async fn health(State(service): State<Arc<JobService>>) -> Json<HealthReport> {
    Json(service.health())
}
