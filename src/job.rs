//! Per-source job orchestration.
//!
//! A job walks `Initializing → Resolving → Building → Fetching → Storing → Notifying → Done`.
//! Fetching and storing each run on a bounded worker pool; results are joined in request
//! order. With `raise_error` set, the first failed fetch stops further dispatch and the
//! remaining requests are recorded as skipped. Artifacts fetched or uploaded before that
//! point are still delivered and never rolled back.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::cds::{CdsApi, CdsFetcher};
use crate::config::{CdsParams, EcpdsParams, Params};
use crate::date::{DateMode, DateRange, latest_run_candidates, parse_zulu_hour, resolve_date_range};
use crate::ecpds::{EcpdsFetcher, FileServer, latest_run_date};
use crate::error::{Error, Result};
use crate::notify::NotificationDispatcher;
use crate::request::{CdsRequest, EcpdsRequest, FetchRequest, build_cds_requests, build_ecpds_requests};
use crate::retry::Clock;
use crate::storage::{Artifact, ObjectStore, StorageManager};

pub const SKIPPED_AFTER_ESCALATION: &str = "skipped after escalation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { key: String, bytes: u64 },
    Failed { reason: String },
}

impl Outcome {
    fn failed(e: &Error) -> Self {
        Outcome::Failed { reason: e.to_string() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutcome {
    pub name: String,
    pub request: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStatus {
    Success,
    Partial,
    Failure,
}

impl JobStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            JobStatus::Success => 0,
            JobStatus::Partial | JobStatus::Failure => 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failure => "failure",
        })
    }
}

/// Outcome of one dataset source in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// `cds` or `ecpds`.
    pub source: String,
    /// Dataset folder, `{ds_id}-{ds_name}`.
    pub dataset: String,
    /// Date range or run date covered.
    pub window: String,
    pub outcomes: Vec<ArtifactOutcome>,
    pub escalated: bool,
    /// Job-level failure that happened before any request was dispatched.
    pub error: Option<String>,
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        let ok = self.succeeded().count();
        if self.error.is_some() || self.escalated || ok == 0 {
            JobStatus::Failure
        } else if ok < self.outcomes.len() {
            JobStatus::Partial
        } else {
            JobStatus::Success
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| !o.outcome.is_success())
    }

    pub fn exit_code(&self) -> u8 {
        self.status().exit_code()
    }
}

/// Worst exit status across every processed source.
pub fn aggregate_exit_code(codes: impl IntoIterator<Item = u8>) -> u8 {
    codes.into_iter().max().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Resolving,
    Building,
    Fetching,
    Storing,
    Notifying,
    Done(JobStatus),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Initializing => f.write_str("initializing"),
            JobState::Resolving => f.write_str("resolving"),
            JobState::Building => f.write_str("building"),
            JobState::Fetching => f.write_str("fetching"),
            JobState::Storing => f.write_str("storing"),
            JobState::Notifying => f.write_str("notifying"),
            JobState::Done(status) => write!(f, "done({status})"),
        }
    }
}

struct StateTracker {
    source: &'static str,
    state: JobState,
}

impl StateTracker {
    fn new(source: &'static str) -> Self {
        info!(source, "job {}", JobState::Initializing);
        Self {
            source,
            state: JobState::Initializing,
        }
    }

    fn enter(&mut self, next: JobState) {
        info!(source = self.source, "job {} -> {next}", self.state);
        self.state = next;
    }
}

/// Adapter seam between the orchestrator and a source.
pub trait FetchAdapter: Sync {
    type Request: FetchRequest;

    fn fetch(&self, request: &Self::Request, staging: &Path) -> Result<Artifact>;
}

impl FetchAdapter for CdsFetcher {
    type Request = CdsRequest;

    fn fetch(&self, request: &CdsRequest, staging: &Path) -> Result<Artifact> {
        CdsFetcher::fetch(self, request, staging)
    }
}

impl FetchAdapter for EcpdsFetcher {
    type Request = EcpdsRequest;

    fn fetch(&self, request: &EcpdsRequest, staging: &Path) -> Result<Artifact> {
        EcpdsFetcher::fetch(self, request, staging)
    }
}

enum Dispatch<T> {
    Ran(Result<T>),
    Skipped,
}

/// Runs requests of one dataset source through fetch and storage.
pub struct JobOrchestrator {
    storage: StorageManager,
    pool: ThreadPool,
    raise_error: bool,
}

impl JobOrchestrator {
    pub fn new(storage: StorageManager, workers: usize, raise_error: bool) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("indra-worker-{i}"))
            .build()?;
        Ok(Self {
            storage,
            pool,
            raise_error,
        })
    }

    fn fetch_all<A: FetchAdapter>(&self, adapter: &A, requests: &[A::Request]) -> Vec<Dispatch<Artifact>> {
        let escalated = AtomicBool::new(false);
        self.pool.install(|| {
            requests
                .par_iter()
                .map(|req| {
                    if escalated.load(Ordering::SeqCst) {
                        debug!("{}: not dispatched, job escalated", req.label());
                        return Dispatch::Skipped;
                    }
                    let r = self.fetch_one(adapter, req);
                    if r.is_err() && self.raise_error {
                        escalated.store(true, Ordering::SeqCst);
                    }
                    Dispatch::Ran(r)
                })
                .collect()
        })
    }

    fn fetch_one<A: FetchAdapter>(&self, adapter: &A, req: &A::Request) -> Result<Artifact> {
        let staging = self.storage.staging_path(req.file_name())?;
        adapter.fetch(req, &staging).inspect_err(|e| {
            error!("{}: {e}", req.label());
            discard(&staging);
        })
    }

    /// Store, upload, then clean up. A failed upload keeps the local file.
    fn deliver(&self, artifact: &Artifact) -> Outcome {
        let path = match self.storage.store(artifact) {
            Ok(p) => p,
            Err(e) => {
                discard(&artifact.local_path);
                return Outcome::failed(&e);
            }
        };
        match self.storage.upload(&path) {
            Ok(uploaded) => Outcome::Succeeded {
                key: self.storage.cleanup(uploaded),
                bytes: artifact.size,
            },
            Err(e) => {
                warn!("{}: {e}; local copy kept at {}", artifact.file_name, path.display());
                Outcome::failed(&e)
            }
        }
    }

    fn run<A: FetchAdapter>(
        &self,
        tracker: &mut StateTracker,
        adapter: &A,
        requests: &[A::Request],
        window: String,
    ) -> JobResult {
        tracker.enter(JobState::Fetching);
        let fetched = self.fetch_all(adapter, requests);
        let escalated = self.raise_error && fetched.iter().any(|d| !matches!(d, Dispatch::Ran(Ok(_))));
        if escalated {
            warn!(source = tracker.source, "fetch failure escalated, remaining requests skipped");
        }

        tracker.enter(JobState::Storing);
        let delivered: Vec<Outcome> = self.pool.install(|| {
            fetched
                .par_iter()
                .map(|d| match d {
                    Dispatch::Ran(Ok(artifact)) => self.deliver(artifact),
                    Dispatch::Ran(Err(e)) => Outcome::failed(e),
                    Dispatch::Skipped => Outcome::Failed {
                        reason: SKIPPED_AFTER_ESCALATION.to_string(),
                    },
                })
                .collect()
        });

        let outcomes = requests
            .iter()
            .zip(delivered)
            .map(|(req, outcome)| ArtifactOutcome {
                name: req.file_name().to_string(),
                request: req.label(),
                outcome,
            })
            .collect();

        JobResult {
            source: tracker.source.to_string(),
            dataset: self.storage.folder().to_string(),
            window,
            outcomes,
            escalated,
            error: None,
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("could not remove {}: {e}", path.display());
    }
}

/// Shared collaborators of a run.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub notifier: NotificationDispatcher,
}

/// Resolve the window and build the requests of a CDS job without fetching anything.
pub fn plan_cds(params: &CdsParams, mode: DateMode, today: NaiveDate) -> Result<(DateRange, Vec<CdsRequest>)> {
    let range = resolve_date_range(mode, params.start_date, params.end_date, today)?;
    let requests = build_cds_requests(params, range)?;
    Ok((range, requests))
}

/// Run date without probing the server: explicit date, configured date, or the newest
/// candidate run.
pub fn planned_ecpds_run_date(params: &EcpdsParams, date: Option<NaiveDate>, clock: &dyn Clock) -> Result<NaiveDate> {
    if let Some(d) = date.or(params.custom_date.filter(|_| !params.get_latest_date)) {
        return Ok(d);
    }
    let hour = parse_zulu_hour(&params.zulu_utc_timestamp)?;
    latest_run_candidates(clock.now(), hour, 1)
        .first()
        .copied()
        .ok_or_else(|| Error::config("ecpds: cannot determine a run date"))
}

pub fn run_cds(params: &Params, mode: DateMode, api: Arc<dyn CdsApi>, services: &Services) -> Result<JobResult> {
    let mut tracker = StateTracker::new("cds");
    let cds = params.cds()?;
    let storage = StorageManager::new(
        &params.shared_params.local_data_dir(),
        &cds.info.folder_name(),
        services.store.clone(),
    );
    let orchestrator = JobOrchestrator::new(storage, cds.workers, cds.raise_error)?;

    tracker.enter(JobState::Resolving);
    let today = services.clock.now().date_naive();

    tracker.enter(JobState::Building);
    let (range, requests) = plan_cds(cds, mode, today)?;
    info!(source = "cds", "{} requests for {range}", requests.len());

    let fetcher = CdsFetcher::from_params(api, services.clock.clone(), cds);
    let result = orchestrator.run(&mut tracker, &fetcher, &requests, range.to_string());
    finish(tracker, services, result, today)
}

/// `date` overrides both `custom_date` and latest-run probing.
pub fn run_ecpds(
    params: &Params,
    date: Option<NaiveDate>,
    server: Arc<dyn FileServer>,
    services: &Services,
) -> Result<JobResult> {
    let mut tracker = StateTracker::new("ecpds");
    let ecpds = params.ecpds()?;
    let storage = StorageManager::new(
        &params.shared_params.local_data_dir(),
        &ecpds.info.folder_name(),
        services.store.clone(),
    );
    let folder = storage.folder().to_string();
    let orchestrator = JobOrchestrator::new(storage, ecpds.workers, ecpds.raise_error)?;

    tracker.enter(JobState::Resolving);
    let now = services.clock.now();
    let run_date = match date {
        Some(d) => d,
        None if ecpds.get_latest_date => match latest_run_date(server.as_ref(), ecpds, now) {
            Ok(d) => d,
            Err(e) if !e.is_configuration() => {
                error!(source = "ecpds", "cannot resolve run date: {e}");
                let result = JobResult {
                    source: "ecpds".into(),
                    dataset: folder,
                    window: "latest".into(),
                    outcomes: Vec::new(),
                    escalated: false,
                    error: Some(e.to_string()),
                };
                return finish(tracker, services, result, now.date_naive());
            }
            Err(e) => return Err(e),
        },
        None => planned_ecpds_run_date(ecpds, None, services.clock.as_ref())?,
    };

    tracker.enter(JobState::Building);
    let requests = build_ecpds_requests(ecpds, run_date)?;
    info!(source = "ecpds", "{} requests for run {run_date}", requests.len());

    let fetcher = EcpdsFetcher::from_params(server, services.clock.clone(), ecpds);
    let result = orchestrator.run(&mut tracker, &fetcher, &requests, run_date.to_string());
    finish(tracker, services, result, run_date)
}

fn finish(mut tracker: StateTracker, services: &Services, result: JobResult, run_date: NaiveDate) -> Result<JobResult> {
    tracker.enter(JobState::Notifying);
    log_summary(&result);
    services.notifier.notify(&result, run_date);
    tracker.enter(JobState::Done(result.status()));
    Ok(result)
}

fn log_summary(result: &JobResult) {
    info!(
        source = %result.source,
        "{} {}: {} ({} succeeded, {} failed)",
        result.dataset,
        result.window,
        result.status(),
        result.succeeded().count(),
        result.failed().count()
    );
    for o in &result.outcomes {
        match &o.outcome {
            Outcome::Succeeded { key, bytes } => info!("  ok     {} -> {key} ({bytes} bytes)", o.name),
            Outcome::Failed { reason } => warn!("  failed {}: {reason}", o.name),
        }
    }
    if let Some(e) = &result.error {
        error!("  job error: {e}");
    }
}
