//! Chunked forecast file server adapter.
//!
//! Every data file has a JSON-lines `.index` companion whose `_offset`/`_length` entries
//! tell us how large the file must be. Data files are fetched in byte-range chunks; a
//! failing chunk is retried on its own before the whole file is restarted.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::EcpdsParams;
use crate::date::{latest_run_candidates, parse_zulu_hour};
use crate::error::{Error, Result};
use crate::request::{EcpdsRequest, FetchRequest, build_ecpds_requests};
use crate::retry::{Clock, RetryPolicy, run_with_retry};
use crate::storage::{Artifact, Download};

/// How far back latest-run probing looks.
pub const LATEST_RUN_LOOKBACK_DAYS: i64 = 5;

/// Byte range `[offset, offset + length)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub offset: u64,
    pub length: u64,
}

impl ChunkDescriptor {
    /// Inclusive last byte, as used by the HTTP `Range` header.
    pub fn last_byte(&self) -> u64 {
        self.offset + self.length.saturating_sub(1)
    }
}

/// Number of chunks [`chunk_plan`] yields.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    total.div_ceil(chunk_size.max(1))
}

/// Split `total` bytes into consecutive chunks of at most `chunk_size` bytes, lazily.
pub fn chunk_plan(total: u64, chunk_size: u64) -> impl DoubleEndedIterator<Item = ChunkDescriptor> {
    let chunk_size = chunk_size.max(1);
    (0..chunk_count(total, chunk_size)).map(move |i| {
        let offset = i * chunk_size;
        ChunkDescriptor {
            offset,
            length: chunk_size.min(total - offset),
        }
    })
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(rename = "_offset")]
    offset: u64,
    #[serde(rename = "_length")]
    length: u64,
}

/// Declared size of a data file: the end of its last indexed field.
pub fn parse_index_total_size(index_url: &str, body: &str) -> Result<u64> {
    let mut total = None;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let entry: IndexEntry = serde_json::from_str(line)
            .map_err(|e| Error::fetch(index_url, "200", format!("malformed index line: {e}")))?;
        let end = entry.offset.checked_add(entry.length).ok_or_else(|| {
            Error::fetch(
                index_url,
                "200",
                format!("index field {}+{} overflows", entry.offset, entry.length),
            )
        })?;
        total = Some(total.map_or(end, |t: u64| t.max(end)));
    }
    total.ok_or_else(|| Error::fetch(index_url, "200", "index has no entries"))
}

/// The remote chunked file server.
pub trait FileServer: Send + Sync {
    fn get_text(&self, url: &str) -> Result<String>;

    /// One byte-range request. Servers that ignore the range are an error.
    fn get_range(&self, url: &str, chunk: ChunkDescriptor) -> Result<Vec<u8>>;

    /// Stream a whole resource into `dest`, truncating it.
    fn get_whole(&self, url: &str, dest: &Path) -> Result<Download>;

    fn exists(&self, url: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct HttpFileServer {
    http: HttpClient,
}

impl HttpFileServer {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("indra/0.1"));
        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }
}

impl FileServer for HttpFileServer {
    fn get_text(&self, url: &str) -> Result<String> {
        Ok(self.http.get(url).send()?.error_for_status()?.text()?)
    }

    fn get_range(&self, url: &str, chunk: ChunkDescriptor) -> Result<Vec<u8>> {
        let mut resp = self
            .http
            .get(url)
            .header(RANGE, format!("bytes={}-{}", chunk.offset, chunk.last_byte()))
            .send()?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::fetch(url, resp.status().as_str(), "expected 206 Partial Content"));
        }
        let mut buf = Vec::with_capacity(chunk.length as usize);
        resp.copy_to(&mut buf)?;
        Ok(buf)
    }

    fn get_whole(&self, url: &str, dest: &Path) -> Result<Download> {
        let mut resp = self.http.get(url).send()?.error_for_status()?;
        let declared_size = resp.content_length();
        let mut file = File::create(dest)?;
        let bytes = resp.copy_to(&mut file)?;
        file.sync_all()?;
        Ok(Download { bytes, declared_size })
    }

    /// HEAD first; some mirrors refuse HEAD, so fall back to a one byte range GET.
    fn exists(&self, url: &str) -> Result<bool> {
        if let Ok(resp) = self.http.head(url).send() {
            match resp.status().as_u16() {
                200 => return Ok(true),
                403 | 404 | 405 | 409 | 429 | 500..=503 => {}
                _ => return Ok(false),
            }
        }
        let resp = self.http.get(url).header(RANGE, "bytes=0-0").send()?;
        Ok(matches!(resp.status().as_u16(), 200 | 206))
    }
}

/// Adapter turning one [`EcpdsRequest`] into an [`Artifact`].
#[derive(Clone)]
pub struct EcpdsFetcher {
    server: Arc<dyn FileServer>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    chunk_policy: RetryPolicy,
    /// `None` disables chunking.
    chunk_size: Option<u64>,
}

impl EcpdsFetcher {
    pub fn new(
        server: Arc<dyn FileServer>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        chunk_retries: u32,
        chunk_size: Option<u64>,
    ) -> Self {
        Self {
            server,
            clock,
            policy,
            chunk_policy: RetryPolicy {
                max_retries: chunk_retries,
                ..policy
            },
            chunk_size,
        }
    }

    pub fn from_params(server: Arc<dyn FileServer>, clock: Arc<dyn Clock>, params: &EcpdsParams) -> Self {
        Self::new(
            server,
            clock,
            params.retry.policy(),
            params.chunk_retries,
            params.chunk.then_some(params.chunk_size),
        )
    }

    pub fn fetch(&self, request: &EcpdsRequest, staging: &Path) -> Result<Artifact> {
        let label = request.label();
        let mut stage = String::from("index");

        let result = run_with_retry(&self.policy, self.clock.as_ref(), &label, |attempt| {
            debug!("{label}: attempt {attempt}");
            self.attempt(request, staging, &mut stage)
        });

        result.map_err(|e| match e {
            Error::Configuration(_) | Error::Integrity { .. } => e,
            other => Error::fetch(label.clone(), stage.clone(), other),
        })
    }

    fn attempt(&self, request: &EcpdsRequest, staging: &Path, stage: &mut String) -> Result<Artifact> {
        let expected_size = if request.is_index() {
            *stage = "download".into();
            let d = self.server.get_whole(&request.url, staging)?;
            d.declared_size.unwrap_or(d.bytes)
        } else {
            *stage = "index".into();
            let body = self.server.get_text(&request.index_url)?;
            let expected = parse_index_total_size(&request.index_url, &body)?;
            match self.chunk_size {
                Some(chunk_size) => self.download_chunked(request, staging, expected, chunk_size, stage)?,
                None => {
                    *stage = "download".into();
                    self.server.get_whole(&request.url, staging)?;
                }
            }
            expected
        };

        *stage = "verify".into();
        let size = fs::metadata(staging)?.len();
        if size != expected_size {
            warn!("{}: assembled {size} bytes, index declares {expected_size}", request.label());
            return Err(Error::Integrity {
                expected: expected_size,
                actual: size,
            });
        }

        info!("{}: downloaded {size} bytes", request.label());
        Ok(Artifact {
            request: request.label(),
            file_name: request.file_name().to_string(),
            local_path: staging.to_path_buf(),
            size,
            expected_size,
        })
    }

    /// Append chunks in order. A chunk that keeps failing past its own budget fails the
    /// attempt, which restarts the whole file.
    fn download_chunked(
        &self,
        request: &EcpdsRequest,
        staging: &Path,
        total: u64,
        chunk_size: u64,
        stage: &mut String,
    ) -> Result<()> {
        let count = chunk_count(total, chunk_size);
        let mut file = File::create(staging)?;

        for (i, chunk) in chunk_plan(total, chunk_size).enumerate() {
            *stage = format!("chunk {}/{count}", i + 1);
            let what = format!("{} {stage}", request.label());
            let bytes = run_with_retry(&self.chunk_policy, self.clock.as_ref(), &what, |_| {
                self.server.get_range(&request.url, chunk)
            })
            .inspect_err(|_| warn!("{what}: chunk retries exhausted, restarting file"))?;
            file.write_all(&bytes)?;
        }

        file.sync_all()?;
        Ok(())
    }
}

/// Newest run date, at most [`LATEST_RUN_LOOKBACK_DAYS`] back, for which every configured
/// forecast time has its index published.
pub fn latest_run_date(server: &dyn FileServer, params: &EcpdsParams, now: DateTime<Utc>) -> Result<NaiveDate> {
    let hour = parse_zulu_hour(&params.zulu_utc_timestamp)?;

    for date in latest_run_candidates(now, hour, LATEST_RUN_LOOKBACK_DAYS) {
        let mut index_urls: Vec<String> = build_ecpds_requests(params, date)?
            .into_iter()
            .map(|r| r.index_url)
            .collect();
        index_urls.dedup();

        let mut published = true;
        for url in &index_urls {
            match server.exists(url) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{url} not published yet");
                    published = false;
                    break;
                }
                Err(e) => {
                    warn!("{url}: existence check failed ({e}), treating {date} as unpublished");
                    published = false;
                    break;
                }
            }
        }
        if published {
            info!("latest published {} run: {date}", params.zulu_utc_timestamp);
            return Ok(date);
        }
    }

    Err(Error::fetch(
        params.base_url()?,
        "not found",
        format!("no {} run published in the last {LATEST_RUN_LOOKBACK_DAYS} days", params.zulu_utc_timestamp),
    ))
}
