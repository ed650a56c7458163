//! In-process fixtures shared by the unit tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use futures_util::stream;

use crate::error::{Result, UpdateError};
use crate::extract::{ExtractionCheck, Extractor, count_files};

/// Deterministic, non-repeating-ish test bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Clone, Copy, Debug)]
pub enum FileMode {
    Normal,
    /// Always answer 200 with the whole body.
    IgnoreRange,
    /// First request sends this many bytes then drops the connection.
    TruncateFirst(usize),
    /// First request sends this many bytes then goes silent.
    StallAfter(usize),
}

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, (Vec<u8>, FileMode)>>,
    requests: Mutex<HashMap<String, Vec<Option<u64>>>>,
}

pub struct TestServer {
    base: String,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/files/:name", get(serve_file))
            .route("/redirect/:hops/:name", get(redirect))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    pub fn put(&self, name: &str, data: Vec<u8>, mode: FileMode) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_owned(), (data, mode));
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/files/{name}", self.base)
    }

    pub fn redirect_url(&self, hops: u32, name: &str) -> String {
        format!("{}/redirect/{hops}/{name}", self.base)
    }

    /// Range start of every request made for `name`, in order.
    pub fn ranges(&self, name: &str) -> Vec<Option<u64>> {
        self.state
            .requests
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().values().map(Vec::len).sum()
    }
}

fn range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let requested = range_start(&headers);
    let hit = {
        let mut requests = state.requests.lock().unwrap();
        let entry = requests.entry(name.clone()).or_default();
        entry.push(requested);
        entry.len()
    };
    let Some((data, mode)) = state.files.lock().unwrap().get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let len = data.len();
    let start = match (mode, requested) {
        (FileMode::IgnoreRange, _) | (_, None) => None,
        (_, Some(start)) => Some(start as usize),
    };
    if let Some(start) = start
        && start >= len
    {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{len}"))
            .body(Body::empty())
            .unwrap();
    }

    let offset = start.unwrap_or(0);
    let body = data[offset..].to_vec();
    let mut builder = Response::builder().header(header::CONTENT_LENGTH, body.len());
    builder = match start {
        Some(start) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{}/{len}", len - 1),
            ),
        None => builder.status(StatusCode::OK),
    };

    let body = match mode {
        FileMode::TruncateFirst(cut) if hit == 1 => {
            let head = Bytes::from(body[..cut.min(body.len())].to_vec());
            Body::from_stream(stream::iter(vec![
                Ok(head),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "cut")),
            ]))
        }
        FileMode::StallAfter(cut) if hit == 1 => {
            let head = Bytes::from(body[..cut.min(body.len())].to_vec());
            Body::from_stream(
                stream::iter(vec![Ok::<_, io::Error>(head)]).chain(stream::pending()),
            )
        }
        _ => Body::from(body),
    };
    builder.body(body).unwrap()
}

async fn redirect(UrlPath((hops, name)): UrlPath<(u32, String)>) -> Response {
    let location = if hops <= 1 {
        format!("/files/{name}")
    } else {
        format!("/redirect/{}/{name}", hops - 1)
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

/// Extractor double that writes a fixed number of files and records calls.
pub struct FakeExtractor {
    files_per_archive: usize,
    fail_extract: bool,
    pub calls: Mutex<Vec<PathBuf>>,
}

impl FakeExtractor {
    pub fn producing(files_per_archive: usize) -> Self {
        Self {
            files_per_archive,
            fail_extract: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_extract: true,
            ..Self::producing(0)
        }
    }

    pub fn extracted(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<()> {
        self.calls.lock().unwrap().push(archive.to_path_buf());
        if self.fail_extract {
            return Err(UpdateError::ExtractionFailed {
                archive: archive.to_path_buf(),
                message: "corrupt central directory".into(),
            });
        }
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let out = dest.join(stem);
        std::fs::create_dir_all(&out).map_err(|e| UpdateError::io_at("create", &out, e))?;
        let total = self.files_per_archive as u64;
        for i in 0..self.files_per_archive {
            let file = out.join(format!("file-{i}.dat"));
            std::fs::write(&file, b"x").map_err(|e| UpdateError::io_at("write", &file, e))?;
            on_progress(i as u64 + 1, total);
        }
        Ok(())
    }

    async fn verify_extracted(&self, dest: &Path, min_file_count: usize) -> Result<ExtractionCheck> {
        let file_count = count_files(dest);
        Ok(ExtractionCheck {
            success: file_count >= min_file_count,
            file_count,
        })
    }
}
