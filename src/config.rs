//! Typed, immutable configuration tree.
//!
//! The YAML file has one `shared_params` section plus one section per dataset source:
//!
//! ```yaml
//! shared_params:
//!   local_data_dir: ~/.indra-data
//!   s3_bucket: my-bucket
//!   email_recipients: [ops@example.org]
//! cds:
//!   ds_id: "0001"
//!   ds_name: era5
//!   ds_source: cds
//!   dataset: reanalysis-era5-single-levels
//!   variables: [2m_temperature, total_precipitation]
//!   regions: [ka]
//!   bounds:
//!     ka: [19, 74, 11, 79]
//! ecpds:
//!   ds_id: "0002"
//!   ds_name: ifs
//!   ds_source: ecpds
//!   forecast_times: [0h, 6h]
//!   extensions: [grib2, index]
//! ```
//!
//! Secrets never live in the YAML file: SMTP settings and climate API credentials come from
//! the environment (see [`SmtpSettings`] and [`CdsCredentials`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::date::{parse_forecast_step, parse_zulu_hour};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sources::{CDS_DEFAULT_URL, resolve_base_url};

#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    pub shared_params: SharedParams,
    #[serde(default)]
    pub cds: Option<CdsParams>,
    #[serde(default)]
    pub ecpds: Option<EcpdsParams>,
}

impl Params {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let params: Params = serde_yaml::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            Error::Yaml(e) => Error::config(format!("invalid YAML in {}: {e}", path.display())),
            other => other,
        })
    }

    /// Typed accessor for the CDS section.
    pub fn cds(&self) -> Result<&CdsParams> {
        self.cds
            .as_ref()
            .ok_or_else(|| Error::config("no `cds` section in configuration"))
    }

    /// Typed accessor for the ECPDS section.
    pub fn ecpds(&self) -> Result<&EcpdsParams> {
        self.ecpds
            .as_ref()
            .ok_or_else(|| Error::config("no `ecpds` section in configuration"))
    }

    pub fn validate(&self) -> Result<()> {
        self.shared_params.validate()?;
        if let Some(cds) = &self.cds {
            cds.validate()?;
        }
        if let Some(ecpds) = &self.ecpds {
            ecpds.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedParams {
    pub local_data_dir: PathBuf,
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub email_recipients: Vec<String>,
    #[serde(default)]
    pub job_name: Option<String>,
}

impl SharedParams {
    /// Local working directory with a leading `~` expanded.
    pub fn local_data_dir(&self) -> PathBuf {
        expand_home(&self.local_data_dir)
    }

    fn validate(&self) -> Result<()> {
        if self.s3_bucket.trim().is_empty() {
            return Err(Error::config("shared_params.s3_bucket must not be empty"));
        }
        if self.local_data_dir.as_os_str().is_empty() {
            return Err(Error::config("shared_params.local_data_dir must not be empty"));
        }
        Ok(())
    }
}

/// Identity of a dataset source, shared by both source sections.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DatasetInfo {
    pub ds_id: String,
    pub ds_name: String,
    pub ds_source: String,
}

impl DatasetInfo {
    /// Folder used both below the local data dir and as object key prefix.
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.ds_id, self.ds_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryParams {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl RetryParams {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

/// Geographic bounds `[north, west, south, east]` in degrees.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct Bounds(pub [f64; 4]);

impl Bounds {
    pub fn north(&self) -> f64 {
        self.0[0]
    }
    pub fn west(&self) -> f64 {
        self.0[1]
    }
    pub fn south(&self) -> f64 {
        self.0[2]
    }
    pub fn east(&self) -> f64 {
        self.0[3]
    }

    fn validate(&self, region: &str) -> Result<()> {
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        let lon_ok = |v: f64| (-180.0..=360.0).contains(&v);
        if !(lat_ok(self.north()) && lat_ok(self.south()) && lon_ok(self.west()) && lon_ok(self.east())) {
            return Err(Error::config(format!("bounds for region {region} out of range: {:?}", self.0)));
        }
        if self.north() < self.south() {
            return Err(Error::config(format!(
                "bounds for region {region}: north {} < south {}",
                self.north(),
                self.south()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdsParams {
    #[serde(flatten)]
    pub info: DatasetInfo,
    /// Remote product identifier, e.g. `reanalysis-era5-single-levels`.
    #[serde(rename = "dataset")]
    pub product: String,
    #[serde(default = "default_product_type")]
    pub product_type: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub bounds: BTreeMap<String, Bounds>,
    #[serde(default = "default_times")]
    pub times: Vec<String>,
    #[serde(default = "default_cds_extension")]
    pub extension: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub raise_error: bool,
    #[serde(flatten)]
    pub retry: RetryParams,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl CdsParams {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// CDS `data_format` value for the configured file extension.
    pub fn data_format(&self) -> &str {
        match self.extension.as_str() {
            "nc" | "netcdf" => "netcdf",
            other => other,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.product.trim().is_empty() {
            return Err(Error::config("cds.dataset must not be empty"));
        }
        for (region, bounds) in &self.bounds {
            bounds.validate(region)?;
        }
        reject_duplicates("cds.variables", self.variables.iter())?;
        reject_duplicates("cds.regions", self.regions.iter())?;
        for t in &self.times {
            let hour = t.split(':').next().and_then(|h| h.parse::<u32>().ok());
            if !matches!(hour, Some(h) if h < 24) {
                return Err(Error::config(format!("cds.times: invalid hour {t}")));
            }
        }
        if !matches!(self.extension.as_str(), "nc" | "netcdf" | "grib") {
            return Err(Error::config(format!("cds.extension must be nc or grib, got {}", self.extension)));
        }
        if self.workers == 0 {
            return Err(Error::config("cds.workers must be > 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::config("cds.poll_interval_secs must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EcpdsParams {
    #[serde(flatten)]
    pub info: DatasetInfo,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_zulu")]
    pub zulu_utc_timestamp: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_forecast_type")]
    pub forecast_type: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_forecast_times")]
    pub forecast_times: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub chunk: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    #[serde(flatten)]
    pub retry: RetryParams,
    #[serde(default = "default_true")]
    pub raise_error: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub get_latest_date: bool,
    #[serde(default)]
    pub custom_date: Option<NaiveDate>,
}

impl EcpdsParams {
    pub fn base_url(&self) -> Result<String> {
        let base = resolve_base_url(&self.source)
            .ok_or_else(|| Error::config(format!("ecpds.source: unknown source {}", self.source)))?;
        url::Url::parse(&base)?;
        Ok(base)
    }

    fn validate(&self) -> Result<()> {
        self.base_url()?;
        parse_zulu_hour(&self.zulu_utc_timestamp)?;
        let steps = self
            .forecast_times
            .iter()
            .map(|ft| parse_forecast_step(ft).map(|h| format!("{h}h")))
            .collect::<Result<Vec<_>>>()?;
        reject_duplicates("ecpds.forecast_times", steps)?;
        reject_duplicates("ecpds.extensions", self.extensions.iter())?;
        if self.chunk_size == 0 {
            return Err(Error::config("ecpds.chunk_size must be > 0"));
        }
        if self.workers == 0 {
            return Err(Error::config("ecpds.workers must be > 0"));
        }
        if !self.get_latest_date && self.custom_date.is_none() {
            return Err(Error::config("ecpds: custom_date is required when get_latest_date is false"));
        }
        Ok(())
    }
}

/// Each entry of a list option maps to its own output file, so repeats are refused.
fn reject_duplicates<T: Ord + std::fmt::Display>(field: &str, items: impl IntoIterator<Item = T>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item in items {
        if let Some(dup) = seen.replace(item) {
            return Err(Error::config(format!("{field}: duplicate entry {dup}")));
        }
    }
    Ok(())
}

/// Credentials for the request/poll climate API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsCredentials {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
struct CdsApiRc {
    url: Option<String>,
    key: Option<String>,
}

impl CdsCredentials {
    /// `CDSAPI_URL` / `CDSAPI_KEY` from the environment, falling back to `~/.cdsapirc`.
    pub fn load() -> Result<Self> {
        let rc = dirs::home_dir()
            .map(|home| home.join(".cdsapirc"))
            .and_then(|path| fs::read_to_string(path).ok());
        Self::resolve(
            std::env::var("CDSAPI_URL").ok(),
            std::env::var("CDSAPI_KEY").ok(),
            rc.as_deref(),
        )
    }

    pub fn resolve(env_url: Option<String>, env_key: Option<String>, rc: Option<&str>) -> Result<Self> {
        let rc: CdsApiRc = match rc {
            Some(s) if !s.trim().is_empty() => serde_yaml::from_str(s)
                .map_err(|e| Error::config(format!("invalid .cdsapirc: {e}")))?,
            _ => CdsApiRc::default(),
        };

        let url = env_url
            .or(rc.url)
            .unwrap_or_else(|| CDS_DEFAULT_URL.to_string());
        let key = env_key
            .or(rc.key)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::config("no CDS API key: set CDSAPI_KEY or create ~/.cdsapirc"))?;

        url::Url::parse(&url)?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            key,
        })
    }
}

/// SMTP relay settings for report emails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub email: String,
    pub password: String,
}

impl SmtpSettings {
    /// Reads `SMTP_SERVER`, `PORT`, `EMAIL` and `PASSWORD`. Returns `None` if any is missing.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        Some(Self {
            server: lookup("SMTP_SERVER")?,
            port: lookup("PORT")?.trim().parse().ok()?,
            email: lookup("EMAIL")?,
            password: lookup("PASSWORD")?,
        })
    }
}

pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    5
}
fn default_max_backoff() -> u64 {
    300
}
fn default_product_type() -> String {
    "reanalysis".to_string()
}
fn default_times() -> Vec<String> {
    (0..24).map(|h| format!("{h:02}:00")).collect()
}
fn default_cds_extension() -> String {
    "nc".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_max_wait() -> u64 {
    3600
}
fn default_workers() -> usize {
    4
}
fn default_source() -> String {
    "ecmwf".to_string()
}
fn default_zulu() -> String {
    "00z".to_string()
}
fn default_model() -> String {
    "ifs".to_string()
}
fn default_resolution() -> String {
    "0p25".to_string()
}
fn default_forecast_type() -> String {
    "oper".to_string()
}
fn default_data_type() -> String {
    "fc".to_string()
}
fn default_forecast_times() -> Vec<String> {
    vec!["0h".to_string(), "6h".to_string()]
}
fn default_extensions() -> Vec<String> {
    vec!["grib2".to_string(), "index".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_chunk_size() -> u64 {
    1_048_576
}
fn default_chunk_retries() -> u32 {
    3
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
shared_params:
  local_data_dir: /tmp/indra-data
  s3_bucket: file:///tmp/indra-bucket
  email_recipients: [ops@example.org]
cds:
  ds_id: "0001"
  ds_name: era5
  ds_source: cds
  dataset: reanalysis-era5-single-levels
  variables: [2m_temperature, total_precipitation]
  regions: [ka]
  bounds:
    ka: [19, 74, 11, 79]
  start_date: 2024-01-01
  end_date: 2024-01-31
ecpds:
  ds_id: "0002"
  ds_name: ifs
  ds_source: ecpds
  forecast_times: [0h, 6h]
  extensions: [grib2, index]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let cds = params.cds().unwrap();
        assert_eq!(cds.info.folder_name(), "0001-era5");
        assert_eq!(cds.product, "reanalysis-era5-single-levels");
        assert_eq!(cds.bounds["ka"], Bounds([19.0, 74.0, 11.0, 79.0]));
        assert_eq!(cds.times.len(), 24);
        assert_eq!(cds.retry.max_retries, 3);
        assert!(!cds.raise_error);
        assert_eq!(cds.start_date, NaiveDate::from_ymd_opt(2024, 1, 1));

        let ecpds = params.ecpds().unwrap();
        assert!(ecpds.chunk);
        assert_eq!(ecpds.chunk_size, 1_048_576);
        assert!(ecpds.raise_error);
        assert_eq!(ecpds.base_url().unwrap(), "https://data.ecmwf.int/forecasts");
    }

    #[test]
    fn missing_section_is_configuration_error() {
        let yaml = "shared_params:\n  local_data_dir: /tmp/x\n  s3_bucket: b\n";
        let params = Params::from_yaml_str(yaml).unwrap();
        assert!(params.cds().unwrap_err().is_configuration());
        assert!(params.ecpds().unwrap_err().is_configuration());
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let yaml = SAMPLE.replace("extensions: [grib2, index]", "extensions: [grib2]\n  chunk_size: 0");
        let err = Params::from_yaml_str(&yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn rejects_duplicate_list_entries() {
        let yaml = SAMPLE.replace(
            "variables: [2m_temperature, total_precipitation]",
            "variables: [2m_temperature, 2m_temperature]",
        );
        let err = Params::from_yaml_str(&yaml).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("cds.variables"), "{err}");

        let yaml = SAMPLE.replace("forecast_times: [0h, 6h]", "forecast_times: [6h, \"6\"]");
        let err = Params::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("ecpds.forecast_times"), "{err}");
    }

    #[test]
    fn rejects_inverted_bounds() {
        let yaml = SAMPLE.replace("ka: [19, 74, 11, 79]", "ka: [11, 74, 19, 79]");
        assert!(Params::from_yaml_str(&yaml).unwrap_err().is_configuration());
    }

    #[test]
    fn cds_credentials_prefer_env_over_rc() {
        let rc = "url: https://rc.example.org/api\nkey: rc-key\n";
        let c = CdsCredentials::resolve(None, Some("env-key".into()), Some(rc)).unwrap();
        assert_eq!(c.url, "https://rc.example.org/api");
        assert_eq!(c.key, "env-key");

        let c = CdsCredentials::resolve(None, None, None);
        assert!(c.unwrap_err().is_configuration());

        let c = CdsCredentials::resolve(None, Some("k".into()), None).unwrap();
        assert_eq!(c.url, CDS_DEFAULT_URL);
    }

    #[test]
    fn smtp_settings_need_every_variable() {
        let full = |k: &str| match k {
            "SMTP_SERVER" => Some("smtp.example.org".to_string()),
            "PORT" => Some("587".to_string()),
            "EMAIL" => Some("bot@example.org".to_string()),
            "PASSWORD" => Some("secret".to_string()),
            _ => None,
        };
        let s = SmtpSettings::from_lookup(full).unwrap();
        assert_eq!(s.port, 587);

        let partial = |k: &str| if k == "PASSWORD" { None } else { full(k) };
        assert!(SmtpSettings::from_lookup(partial).is_none());
    }

    #[test]
    fn expands_tilde() {
        let p = expand_home(Path::new("/abs/path"));
        assert_eq!(p, PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/data")), home.join("data"));
        }
    }
}
