use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::{Result, UpdateError};
use crate::util::redact_url;

const WRITE_BUF: usize = 256 * 1024;

/// A single transfer: where from, where to, and what is already on disk.
#[derive(Clone, Copy, Debug)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub destination: &'a Path,
    /// Bytes already on disk; clamped to the real file size before use.
    pub resume_from: u64,
    pub expected_size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub completed: bool,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub was_paused: bool,
}

impl DownloadOutcome {
    fn paused(bytes_downloaded: u64, total_bytes: u64) -> Self {
        Self {
            completed: false,
            bytes_downloaded,
            total_bytes,
            was_paused: true,
        }
    }
}

/// Pause handle for the download that is currently running.
#[derive(Clone, Debug)]
pub struct DownloadController {
    id: u64,
    token: CancellationToken,
}

impl DownloadController {
    pub fn pause(&self) {
        self.token.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum AttemptError {
    Transient(String),
    Fatal(UpdateError),
}

impl From<UpdateError> for AttemptError {
    fn from(err: UpdateError) -> Self {
        Self::Fatal(err)
    }
}

/// Runs at most one HTTP transfer at a time with range resume and retries.
pub struct DownloadManager {
    client: Client,
    policy: RetryPolicy,
    active: Mutex<Option<DownloadController>>,
    next_id: AtomicU64,
}

impl DownloadManager {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(policy.connect_timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!("download: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            policy,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install a fresh controller, pausing whichever download held the previous one.
    pub fn begin(&self) -> DownloadController {
        let controller = DownloadController {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(controller.clone()) {
            debug!("download: superseding controller {}", previous.id);
            previous.pause();
        }
        controller
    }

    /// Pause the active download, if any. Returns whether one was running.
    pub fn pause_active(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(controller) if !controller.is_paused() => {
                info!("download: pause requested");
                controller.pause();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|c| !c.is_paused())
    }

    fn release(&self, controller: &DownloadController) {
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|c| c.id == controller.id) {
            *slot = None;
        }
    }

    /// Download `request.url` into `request.destination`.
    ///
    /// Resolves with `was_paused` when paused; every byte received before the
    /// pause is on disk. Errors only for non-retryable failures or once the
    /// retry budget is spent.
    pub async fn download(
        &self,
        request: DownloadRequest<'_>,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<DownloadOutcome> {
        let controller = self.begin();
        let result = self.run(request, &controller, on_progress).await;
        self.release(&controller);
        result
    }

    async fn run(
        &self,
        request: DownloadRequest<'_>,
        controller: &DownloadController,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<DownloadOutcome> {
        let display_url = redact_url(request.url);
        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::io_at("create download directory", parent, e))?;
        }

        let on_disk = file_len(request.destination).await;
        let mut offset = request.resume_from.min(on_disk);
        if offset > 0 && on_disk > offset {
            // Appending after stale trailing bytes would duplicate data.
            truncate(request.destination, offset).await?;
        }
        let mut known_total = request.expected_size;
        let mut retry: u32 = 0;
        info!(
            "download: {} -> {} (resume at {} bytes)",
            display_url,
            request.destination.display(),
            offset
        );

        loop {
            if controller.is_paused() {
                let on_disk = file_len(request.destination).await;
                return Ok(DownloadOutcome::paused(on_disk, known_total.unwrap_or(0)));
            }

            let error = match self
                .attempt(request, offset, controller, &mut known_total, on_progress)
                .await
            {
                Ok(outcome) => {
                    if outcome.was_paused {
                        info!(
                            "download: paused at {} bytes of {}",
                            outcome.bytes_downloaded, display_url
                        );
                    } else {
                        info!(
                            "download: completed {} ({} bytes)",
                            request.destination.display(),
                            outcome.total_bytes
                        );
                    }
                    return Ok(outcome);
                }
                Err(AttemptError::Fatal(err)) => {
                    warn!("download: {} failed: {}", display_url, err);
                    return Err(err);
                }
                Err(AttemptError::Transient(message)) => message,
            };

            retry += 1;
            if retry > self.policy.max_retries {
                warn!(
                    "download: giving up on {} after {} retries: {}",
                    display_url, self.policy.max_retries, error
                );
                return Err(UpdateError::network(
                    display_url,
                    format!(
                        "connection failed after {} retries: {error}",
                        self.policy.max_retries
                    ),
                ));
            }

            let delay = self.policy.backoff_for(retry);
            warn!(
                "download: {} interrupted ({}); retry {}/{} in {:?}",
                display_url, error, retry, self.policy.max_retries, delay
            );
            tokio::select! {
                _ = controller.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            // The file on disk is the source of truth for where to resume.
            offset = file_len(request.destination).await;
        }
    }

    async fn attempt(
        &self,
        request: DownloadRequest<'_>,
        offset: u64,
        controller: &DownloadController,
        known_total: &mut Option<u64>,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> std::result::Result<DownloadOutcome, AttemptError> {
        let response = match self.send_following_redirects(request.url, offset, controller).await? {
            Some(response) => response,
            None => return Ok(DownloadOutcome::paused(offset, known_total.unwrap_or(0))),
        };

        let status = response.status();
        let (resuming, total) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(ContentRange::parse);
                if let Some(range) = range
                    && range.start != offset
                {
                    return Err(AttemptError::Fatal(UpdateError::network(
                        redact_url(request.url),
                        format!(
                            "server resumed at byte {} instead of {offset}",
                            range.start
                        ),
                    )));
                }
                let total = range
                    .and_then(|r| r.total)
                    .or_else(|| response.content_length().map(|len| offset + len));
                (true, total)
            }
            StatusCode::OK => {
                if offset > 0 {
                    debug!("download: server ignored range request, restarting from zero");
                }
                (false, response.content_length())
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 && *known_total == Some(offset) => {
                debug!("download: range past end, file already complete");
                on_progress(offset, offset);
                return Ok(DownloadOutcome {
                    completed: true,
                    bytes_downloaded: offset,
                    total_bytes: offset,
                    was_paused: false,
                });
            }
            other => {
                return Err(AttemptError::Fatal(UpdateError::network(
                    redact_url(request.url),
                    format!("unexpected HTTP status {other}"),
                )));
            }
        };

        if let (Some(expected), Some(actual)) = (request.expected_size, total)
            && expected != actual
        {
            return Err(AttemptError::Fatal(UpdateError::SizeMismatch {
                expected,
                actual,
            }));
        }
        if total.is_some() {
            *known_total = total;
        }

        let file = if resuming {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(request.destination)
                .await
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(request.destination)
                .await
        }
        .map_err(|e| UpdateError::io_at("open", request.destination, e))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUF, file);

        let mut downloaded = if resuming { offset } else { 0 };
        let total_hint = total.unwrap_or(0);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = controller.token.cancelled() => {
                    flush(&mut writer, request.destination).await?;
                    return Ok(DownloadOutcome::paused(downloaded, total_hint));
                }
                next = tokio::time::timeout(self.policy.idle_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    flush(&mut writer, request.destination).await?;
                    return Err(AttemptError::Transient(format!(
                        "connection idle for {:?}",
                        self.policy.idle_timeout
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    flush(&mut writer, request.destination).await?;
                    return Err(AttemptError::Transient(format!("stream aborted: {err}")));
                }
                Ok(Some(Ok(chunk))) => {
                    writer
                        .write_all(&chunk)
                        .await
                        .map_err(|e| UpdateError::io_at("write", request.destination, e))?;
                    downloaded += chunk.len() as u64;
                    on_progress(downloaded, total_hint);
                }
            }
        }
        flush(&mut writer, request.destination).await?;
        drop(writer);

        match total {
            Some(total) if downloaded < total => Err(AttemptError::Transient(format!(
                "connection closed early: received {downloaded} of {total} bytes"
            ))),
            Some(total) if downloaded > total => Err(AttemptError::Fatal(UpdateError::SizeMismatch {
                expected: total,
                actual: downloaded,
            })),
            _ => {
                on_progress(downloaded, downloaded);
                Ok(DownloadOutcome {
                    completed: true,
                    bytes_downloaded: downloaded,
                    total_bytes: downloaded,
                    was_paused: false,
                })
            }
        }
    }

    /// Issue the GET, following up to `max_redirects` hops by hand.
    /// Returns `None` if paused while waiting for response headers.
    async fn send_following_redirects(
        &self,
        url: &str,
        offset: u64,
        controller: &DownloadController,
    ) -> std::result::Result<Option<Response>, AttemptError> {
        let mut current = url.to_owned();
        let mut redirects = 0usize;
        loop {
            let mut builder = self
                .client
                .get(&current)
                .header(USER_AGENT, concat!("patchline/", env!("CARGO_PKG_VERSION")));
            if offset > 0 {
                builder = builder.header(RANGE, format!("bytes={offset}-"));
            }

            let response = tokio::select! {
                _ = controller.token.cancelled() => return Ok(None),
                sent = tokio::time::timeout(self.policy.idle_timeout, builder.send()) => match sent {
                    Ok(sent) => sent.map_err(|err| classify_send_error(&current, err))?,
                    Err(_) => {
                        return Err(AttemptError::Transient(format!(
                            "no response headers within {:?}",
                            self.policy.idle_timeout
                        )));
                    }
                },
            };

            if !response.status().is_redirection() {
                return Ok(Some(response));
            }

            redirects += 1;
            if redirects > self.policy.max_redirects {
                return Err(AttemptError::Fatal(UpdateError::network(
                    redact_url(url),
                    format!("too many redirects (limit {})", self.policy.max_redirects),
                )));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    AttemptError::Fatal(UpdateError::network(
                        redact_url(&current),
                        "redirect without a Location header",
                    ))
                })?;
            let next = Url::parse(&current)
                .and_then(|base| base.join(location))
                .map_err(|e| {
                    AttemptError::Fatal(UpdateError::network(
                        redact_url(&current),
                        format!("invalid redirect target: {e}"),
                    ))
                })?;
            debug!("download: redirect {} -> {}", redirects, redact_url(next.as_str()));
            current = next.into();
        }
    }
}

fn classify_send_error(url: &str, err: reqwest::Error) -> AttemptError {
    if err.is_builder() {
        AttemptError::Fatal(UpdateError::network(
            redact_url(url),
            format!("invalid request: {err}"),
        ))
    } else {
        AttemptError::Transient(format!("connection error: {err}"))
    }
}

async fn flush(writer: &mut BufWriter<fs::File>, path: &Path) -> Result<()> {
    writer
        .flush()
        .await
        .map_err(|e| UpdateError::io_at("flush", path, e))
}

async fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| UpdateError::io_at("open", path, e))?;
    file.set_len(len)
        .await
        .map_err(|e| UpdateError::io_at("truncate", path, e))
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    total: Option<u64>,
}

impl ContentRange {
    fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sha2::{Digest, Sha256};

    use crate::testing::{FileMode, TestServer, payload};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(300),
            ..RetryPolicy::default()
        }
    }

    fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[test]
    fn parses_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                total: Some(1000)
            })
        );
        assert_eq!(ContentRange::parse("bytes 9-3/10"), None);
        assert_eq!(ContentRange::parse("bytes 5-9/*").unwrap().total, None);
        assert_eq!(ContentRange::parse("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn fresh_download_reports_final_progress() {
        let server = TestServer::start().await;
        let data = payload(200_000);
        server.put("full.zip", data.clone(), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("full.zip");

        let manager = DownloadManager::new(fast_policy());
        let mut last = (0, 0);
        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("full.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: Some(data.len() as u64),
                },
                &mut |current, total| last = (current, total),
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert!(!outcome.was_paused);
        assert_eq!(last, (data.len() as u64, data.len() as u64));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn resumes_partial_file_with_range_request() {
        let server = TestServer::start().await;
        let data = payload(150_000);
        server.put("patch.zip", data.clone(), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("patch.zip");
        std::fs::write(&dest, &data[..60_000]).unwrap();

        let manager = DownloadManager::new(fast_policy());
        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("patch.zip"),
                    destination: &dest,
                    resume_from: 60_000,
                    expected_size: Some(data.len() as u64),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(server.ranges("patch.zip"), vec![Some(60_000)]);
        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len(), data.len());
        assert_eq!(digest(&written), digest(&data));
    }

    #[tokio::test]
    async fn resume_offset_never_exceeds_file_on_disk() {
        let server = TestServer::start().await;
        let data = payload(10_000);
        server.put("p.zip", data.clone(), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.zip");
        std::fs::write(&dest, &data[..1_000]).unwrap();

        let manager = DownloadManager::new(fast_policy());
        manager
            .download(
                DownloadRequest {
                    url: &server.url("p.zip"),
                    destination: &dest,
                    resume_from: 9_000,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(server.ranges("p.zip"), vec![Some(1_000)]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn stale_tail_beyond_resume_offset_is_dropped() {
        let server = TestServer::start().await;
        let data = payload(10_000);
        server.put("p.zip", data.clone(), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.zip");
        std::fs::write(&dest, &data[..6_000]).unwrap();

        let manager = DownloadManager::new(fast_policy());
        manager
            .download(
                DownloadRequest {
                    url: &server.url("p.zip"),
                    destination: &dest,
                    resume_from: 4_000,
                    expected_size: Some(data.len() as u64),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(server.ranges("p.zip"), vec![Some(4_000)]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn server_ignoring_range_restarts_cleanly() {
        let server = TestServer::start().await;
        let data = payload(20_000);
        server.put("p.zip", data.clone(), FileMode::IgnoreRange);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.zip");
        std::fs::write(&dest, &data[..5_000]).unwrap();

        let manager = DownloadManager::new(fast_policy());
        manager
            .download(
                DownloadRequest {
                    url: &server.url("p.zip"),
                    destination: &dest,
                    resume_from: 5_000,
                    expected_size: Some(data.len() as u64),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn retries_after_aborted_stream_using_bytes_on_disk() {
        let server = TestServer::start().await;
        let data = payload(300_000);
        server.put("flaky.zip", data.clone(), FileMode::TruncateFirst(100_000));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("flaky.zip");

        let manager = DownloadManager::new(fast_policy());
        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("flaky.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: Some(data.len() as u64),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        let ranges = server.ranges("flaky.zip");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], None);
        assert_eq!(ranges[1], Some(100_000));
        assert_eq!(digest(&std::fs::read(&dest).unwrap()), digest(&data));
    }

    #[tokio::test]
    async fn idle_watchdog_aborts_and_retries() {
        let server = TestServer::start().await;
        let data = payload(50_000);
        server.put("stall.zip", data.clone(), FileMode::StallAfter(10_000));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("stall.zip");

        let manager = DownloadManager::new(fast_policy());
        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("stall.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(server.ranges("stall.zip"), vec![None, Some(10_000)]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn pause_keeps_bytes_and_resume_finishes_exactly() {
        let server = TestServer::start().await;
        let data = payload(80_000);
        server.put("big.zip", data.clone(), FileMode::StallAfter(30_000));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.zip");

        let manager = DownloadManager::new(RetryPolicy {
            idle_timeout: Duration::from_secs(30),
            ..fast_policy()
        });
        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("big.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: Some(data.len() as u64),
                },
                &mut |current, _| {
                    if current >= 30_000 {
                        manager.pause_active();
                    }
                },
            )
            .await
            .unwrap();

        assert!(outcome.was_paused);
        assert!(!outcome.completed);
        assert_eq!(outcome.bytes_downloaded, 30_000);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 30_000);

        let outcome = manager
            .download(
                DownloadRequest {
                    url: &server.url("big.zip"),
                    destination: &dest,
                    resume_from: 30_000,
                    expected_size: Some(data.len() as u64),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(digest(&std::fs::read(&dest).unwrap()), digest(&data));
    }

    #[tokio::test]
    async fn size_mismatch_is_not_retried() {
        let server = TestServer::start().await;
        server.put("p.zip", payload(1_000), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();

        let manager = DownloadManager::new(fast_policy());
        let err = manager
            .download(
                DownloadRequest {
                    url: &server.url("p.zip"),
                    destination: &dir.path().join("p.zip"),
                    resume_from: 0,
                    expected_size: Some(2_000),
                },
                &mut |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpdateError::SizeMismatch {
                expected: 2_000,
                actual: 1_000
            }
        ));
        assert_eq!(server.ranges("p.zip").len(), 1);
    }

    #[tokio::test]
    async fn http_errors_are_fatal() {
        let server = TestServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let manager = DownloadManager::new(fast_policy());
        let err = manager
            .download(
                DownloadRequest {
                    url: &server.url("missing.zip"),
                    destination: &dir.path().join("missing.zip"),
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::NetworkFatal { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn follows_redirects_up_to_the_limit() {
        let server = TestServer::start().await;
        let data = payload(4_000);
        server.put("r.zip", data.clone(), FileMode::Normal);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("r.zip");

        let manager = DownloadManager::new(fast_policy());
        manager
            .download(
                DownloadRequest {
                    url: &server.redirect_url(10, "r.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        let err = manager
            .download(
                DownloadRequest {
                    url: &server.redirect_url(11, "r.zip"),
                    destination: &dest,
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many redirects"));
    }

    #[tokio::test]
    async fn unreachable_host_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        });
        let err = manager
            .download(
                DownloadRequest {
                    url: "http://127.0.0.1:9/unreachable.zip",
                    destination: &dir.path().join("u.zip"),
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 2 retries"));
    }

    #[tokio::test]
    async fn silent_server_trips_the_watchdog_before_headers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = std::sync::Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(RetryPolicy {
            max_retries: 1,
            ..fast_policy()
        });
        let url = format!("http://{addr}/silent.zip");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            manager.download(
                DownloadRequest {
                    url: &url,
                    destination: &dir.path().join("silent.zip"),
                    resume_from: 0,
                    expected_size: None,
                },
                &mut |_, _| {},
            ),
        )
        .await
        .expect("download should give up instead of hanging");

        let err = result.unwrap_err();
        assert!(matches!(err, UpdateError::NetworkFatal { .. }), "{err}");
        assert!(err.to_string().contains("no response headers"), "{err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(!manager.is_active());
    }

    #[test]
    fn new_controller_supersedes_previous() {
        let manager = DownloadManager::new(RetryPolicy::default());
        let first = manager.begin();
        let second = manager.begin();
        assert!(first.is_paused());
        assert!(!second.is_paused());
        assert!(manager.pause_active());
        assert!(second.is_paused());
        assert!(!manager.pause_active());
    }
}
