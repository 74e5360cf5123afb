use crate::{
    config::Config,
    error::AppError,
    files,
    lease::{Lease, LeasedStream, Leases},
    transcode::Transcoder,
};
use anyhow::Result;
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::{
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{error, info};

/// Content type of every converted artifact.
pub const AUDIO_MIME: &str = "audio/mpeg";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub transcoder: Arc<Transcoder>,
    pub leases: Leases,
    /// Fired on process shutdown; aborts running transcodes.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new(mut config: Config, shutdown: CancellationToken) -> Result<Self> {
        for dir in [&config.input_dir, &config.output_dir, &config.station_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        config.canonicalize_dirs()?;
        Ok(Self {
            transcoder: Arc::new(Transcoder::from_config(&config.transcoder)),
            config: Arc::new(config),
            leases: Leases::new(),
            shutdown,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let convert_routes = Router::new()
        .route("/convert", post(convert))
        .layer(DefaultBodyLimit::max(state.config.max_file_size as usize));
    let station_routes = Router::new()
        .route("/api/files", get(list_station).post(upload_station))
        .route(
            "/api/files/:name",
            get(download_station).delete(delete_station),
        )
        .layer(DefaultBodyLimit::max(
            state.config.station_max_file_size as usize,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(convert_routes)
        .merge(station_routes)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let res = next.run(req).await;
    info!(
        %method,
        %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    res
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// A validated `file` field that has been written to disk.
struct Upload {
    /// Sanitized, never empty.
    name: String,
    path: PathBuf,
}

/// Stream the `file` field of the body into `dir`. `check_type` sees the
/// declared content type before any bytes are read. A part without a
/// filename is an ordinary form field, not a file.
async fn receive_upload<F>(
    multipart: &mut Multipart,
    dir: &FsPath,
    check_type: F,
) -> Result<Upload, AppError>
where
    F: Fn(&str) -> Result<(), AppError>,
{
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Multipart(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        if original.is_empty() {
            return Err(AppError::EmptyFilename);
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        check_type(&content_type)?;
        let name = files::sanitize_filename(&original);
        if name.is_empty() {
            return Err(AppError::EmptyFilename);
        }
        let mut incoming = files::IncomingFile::create(dir, &name).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::Multipart(e.to_string()))?
        {
            incoming.write(&chunk).await?;
        }
        let path = incoming.finish().await?;
        return Ok(Upload { name, path });
    }
    Err(AppError::MissingFile)
}

fn accepts_media(content_type: &str, accept_audio: bool) -> bool {
    content_type.starts_with("video/") || (accept_audio && content_type.starts_with("audio/"))
}

fn attachment(
    file: tokio::fs::File,
    lease: Lease,
    name: &str,
    mime: &str,
) -> Result<Response, AppError> {
    let body = StreamBody::new(LeasedStream::new(ReaderStream::new(file), lease));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime).map_err(anyhow::Error::from)?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name))
            .map_err(anyhow::Error::from)?,
    );
    Ok((headers, body).into_response())
}

async fn convert(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let accept_audio = state.config.transcoder.accept_audio;
    let upload = receive_upload(&mut multipart, &state.config.input_dir, |ct| {
        if accepts_media(ct, accept_audio) {
            Ok(())
        } else {
            Err(AppError::UnsupportedType(ct.to_string()))
        }
    })
    .await?;

    // removed on every path out of here except success, including the
    // client going away mid-transcode
    let input = files::Scratch::new(upload.path);
    let output_name = files::converted_name(&upload.name);
    let output = state.config.output_dir.join(&output_name);

    if let Err(e) = state
        .transcoder
        .transcode(input.path(), &output, &state.shutdown)
        .await
    {
        error!(
            input = %input.path().display(),
            error = %e,
            diagnostics = e.diagnostics().unwrap_or(""),
            "conversion failed"
        );
        return Err(AppError::Conversion(e));
    }
    // left for the janitor
    let input = input.keep();
    info!(input = %input.display(), output = %output.display(), "converted");

    let lease = state.leases.acquire(&output);
    let file = tokio::fs::File::open(&output).await?;
    attachment(file, lease, &output_name, AUDIO_MIME)
}

async fn list_station(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(files::list_files(&state.config.station_dir).await?))
}

async fn upload_station(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let upload = receive_upload(&mut multipart, &state.config.station_dir, |_| Ok(())).await?;
    info!(path = %upload.path.display(), "stored upload");
    Ok("OK")
}

async fn download_station(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let path = files::resolve(&state.config.station_dir, &name).ok_or(AppError::NotFound)?;
    let lease = state.leases.acquire(&path);
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(AppError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    attachment(file, lease, &name, mime.as_ref())
}

async fn delete_station(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let path = files::resolve(&state.config.station_dir, &name).ok_or(AppError::NotFound)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!(path = %path.display(), "deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Serve the router until `state.shutdown` fires.
pub async fn run_http_server(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.bind.parse()?;
    let shutdown = state.shutdown.clone();
    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
