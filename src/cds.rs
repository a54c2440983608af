//! Request/poll climate data store adapter.
//!
//! A retrieval is a submit, poll until the remote job settles, then download cycle. Any
//! failure (remote `failed`, poll timeout, transport error, size mismatch) restarts the
//! whole cycle with a fresh submission; there is no partial resume.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{CdsCredentials, CdsParams};
use crate::error::{Error, Result};
use crate::request::{CdsRequest, FetchRequest};
use crate::retry::{Clock, RetryPolicy, run_with_retry};
use crate::storage::{Artifact, Download};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RemoteStatus {
    /// Map the API's job states onto the four states the adapter cares about.
    pub fn from_api(s: &str) -> Self {
        match s {
            "accepted" | "queued" => RemoteStatus::Queued,
            "running" => RemoteStatus::Running,
            "successful" | "completed" => RemoteStatus::Completed,
            _ => RemoteStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Queued => "queued",
            RemoteStatus::Running => "running",
            RemoteStatus::Completed => "completed",
            RemoteStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote request/poll API.
pub trait CdsApi: Send + Sync {
    fn submit(&self, request: &CdsRequest) -> Result<String>;

    fn status(&self, job_id: &str) -> Result<RemoteStatus>;

    /// Stream the result of a completed job into `dest`, truncating it.
    fn download(&self, job_id: &str, dest: &Path) -> Result<Download>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "jobID")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    asset: Asset,
}

#[derive(Debug, Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
    #[serde(rename = "file:size")]
    size: Option<u64>,
}

/// HTTP client for the climate data store retrieve API.
#[derive(Debug, Clone)]
pub struct HttpCdsApi {
    http: HttpClient,
    url: String,
}

impl HttpCdsApi {
    pub fn new(credentials: &CdsCredentials) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("indra/0.1"));
        let mut token = HeaderValue::from_str(&credentials.key)
            .map_err(|_| Error::config("CDS API key contains invalid characters"))?;
        token.set_sensitive(true);
        headers.insert(HeaderName::from_static("private-token"), token);

        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            url: credentials.url.clone(),
        })
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/retrieve/v1/jobs/{job_id}", self.url)
    }
}

impl CdsApi for HttpCdsApi {
    fn submit(&self, request: &CdsRequest) -> Result<String> {
        let url = format!("{}/retrieve/v1/processes/{}/execution", self.url, request.product);
        let resp: SubmitResponse = self
            .http
            .post(url)
            .json(&json!({ "inputs": request.inputs() }))
            .send()?
            .error_for_status()?
            .json()?;
        Ok(resp.job_id)
    }

    fn status(&self, job_id: &str) -> Result<RemoteStatus> {
        let resp: StatusResponse = self.http.get(self.job_url(job_id)).send()?.error_for_status()?.json()?;
        Ok(RemoteStatus::from_api(&resp.status))
    }

    fn download(&self, job_id: &str, dest: &Path) -> Result<Download> {
        let results: ResultsResponse = self
            .http
            .get(format!("{}/results", self.job_url(job_id)))
            .send()?
            .error_for_status()?
            .json()?;

        let mut resp = self.http.get(&results.asset.value.href).send()?.error_for_status()?;
        let declared_size = results.asset.value.size.or(resp.content_length());
        let mut file = File::create(dest)?;
        let bytes = resp.copy_to(&mut file)?;
        file.sync_all()?;

        Ok(Download { bytes, declared_size })
    }
}

/// Adapter turning one [`CdsRequest`] into an [`Artifact`].
#[derive(Clone)]
pub struct CdsFetcher {
    api: Arc<dyn CdsApi>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    poll_interval: Duration,
    max_wait: Duration,
}

impl CdsFetcher {
    pub fn new(
        api: Arc<dyn CdsApi>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            api,
            clock,
            policy,
            poll_interval,
            max_wait,
        }
    }

    pub fn from_params(api: Arc<dyn CdsApi>, clock: Arc<dyn Clock>, params: &CdsParams) -> Self {
        Self::new(api, clock, params.retry.policy(), params.poll_interval(), params.max_wait())
    }

    /// Retrieve `request` into `staging`. After exhausting retries this fails with a
    /// fetch error carrying the last known remote status, or with the integrity error if
    /// the last attempt downloaded a file of the wrong size.
    pub fn fetch(&self, request: &CdsRequest, staging: &Path) -> Result<Artifact> {
        let label = request.label();
        let mut last_status = String::from("not submitted");

        let result = run_with_retry(&self.policy, self.clock.as_ref(), &label, |attempt| {
            debug!("{label}: attempt {attempt}");
            self.attempt(request, staging, &mut last_status)
        });

        result.map_err(|e| match e {
            Error::Configuration(_) | Error::Integrity { .. } => e,
            other => Error::fetch(label.clone(), last_status.clone(), other),
        })
    }

    fn attempt(&self, request: &CdsRequest, staging: &Path, last_status: &mut String) -> Result<Artifact> {
        let job_id = self.api.submit(request)?;
        *last_status = RemoteStatus::Queued.to_string();
        info!("{}: submitted as job {job_id}", request.label());

        self.wait_until_completed(&job_id, last_status)?;

        let download = self.api.download(&job_id, staging)?;
        let expected_size = download.declared_size.unwrap_or(download.bytes);
        if download.bytes != expected_size {
            return Err(Error::Integrity {
                expected: expected_size,
                actual: download.bytes,
            });
        }

        info!("{}: downloaded {} bytes", request.label(), download.bytes);
        Ok(Artifact {
            request: request.label(),
            file_name: request.file_name().to_string(),
            local_path: staging.to_path_buf(),
            size: download.bytes,
            expected_size,
        })
    }

    /// Poll on a fixed interval until the job settles or `max_wait` elapses.
    fn wait_until_completed(&self, job_id: &str, last_status: &mut String) -> Result<()> {
        let started = self.clock.now();
        loop {
            let status = self.api.status(job_id)?;
            *last_status = status.to_string();
            match status {
                RemoteStatus::Completed => return Ok(()),
                RemoteStatus::Failed => {
                    return Err(Error::fetch(job_id, status.as_str(), "remote job failed"));
                }
                RemoteStatus::Queued | RemoteStatus::Running => {}
            }

            let waited = (self.clock.now() - started).to_std().unwrap_or_default();
            if waited >= self.max_wait {
                return Err(Error::fetch(
                    job_id,
                    status.as_str(),
                    format!("not completed after {waited:?}"),
                ));
            }
            debug!("job {job_id} is {status}, next poll in {:?}", self.poll_interval);
            self.clock.sleep(self.poll_interval);
        }
    }
}
