//! Fully resolved fetch requests and the builders that expand a dataset
//! configuration into them.
//!
//! Expansion is a cross product with a stable order: region then variable for the
//! climate API, forecast time then extension for the forecast server. File names are
//! unique per request, so no two requests ever write the same local path.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Value, json};

use crate::config::{Bounds, CdsParams, EcpdsParams};
use crate::date::{DateRange, parse_forecast_step, parse_zulu_hour, run_datetime};
use crate::error::{Error, Result};
use crate::url_builder::{INDEX_EXTENSION, format_file_name, format_url, index_url, patch_stream};

/// Common view of a source specific request.
pub trait FetchRequest: Send + Sync {
    /// File name of the resulting artifact, unique within a dataset.
    fn file_name(&self) -> &str;

    /// Short human readable label used in logs and reports.
    fn label(&self) -> String;
}

/// One retrieval from the request/poll climate API.
#[derive(Debug, Clone, PartialEq)]
pub struct CdsRequest {
    pub product: String,
    pub product_type: String,
    pub region: String,
    pub bounds: Bounds,
    pub variable: String,
    pub range: DateRange,
    pub times: Vec<String>,
    pub data_format: String,
    pub file_name: String,
}

impl CdsRequest {
    /// JSON `inputs` object submitted to the API.
    pub fn inputs(&self) -> Value {
        let days: Vec<NaiveDate> = self.range.days().collect();
        let fmt = |pattern: &str| -> Vec<String> {
            let set: BTreeSet<String> = days.iter().map(|d| d.format(pattern).to_string()).collect();
            set.into_iter().collect()
        };

        json!({
            "product_type": [self.product_type],
            "variable": [self.variable],
            "year": fmt("%Y"),
            "month": fmt("%m"),
            "day": fmt("%d"),
            "time": self.times,
            "area": [self.bounds.north(), self.bounds.west(), self.bounds.south(), self.bounds.east()],
            "data_format": self.data_format,
            "download_format": "unarchived",
        })
    }
}

impl FetchRequest for CdsRequest {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn label(&self) -> String {
        format!("{}/{}/{}", self.product, self.region, self.variable)
    }
}

/// One file on the chunked forecast distribution server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcpdsRequest {
    pub url: String,
    pub index_url: String,
    pub run: DateTime<Utc>,
    pub forecast_time: String,
    pub step: u32,
    pub extension: String,
    pub file_name: String,
}

impl EcpdsRequest {
    /// The index resource itself is requested; its size comes from the server, not an index.
    pub fn is_index(&self) -> bool {
        self.extension == INDEX_EXTENSION
    }
}

impl FetchRequest for EcpdsRequest {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn label(&self) -> String {
        format!("{}/{}", self.forecast_time, self.extension)
    }
}

/// One request per (region, variable), region-major.
pub fn build_cds_requests(params: &CdsParams, range: DateRange) -> Result<Vec<CdsRequest>> {
    if params.regions.is_empty() {
        return Err(Error::config("cds: no regions configured"));
    }
    if params.variables.is_empty() {
        return Err(Error::config("cds: no variables configured"));
    }

    let ext = params.extension.as_str();
    let mut out = Vec::with_capacity(params.regions.len() * params.variables.len());
    for region in &params.regions {
        let bounds = params
            .bounds
            .get(region)
            .copied()
            .ok_or_else(|| Error::config(format!("cds: no bounds for region {region}")))?;

        for variable in &params.variables {
            let file_name = format!(
                "{}-{}-{region}-{variable}-{}-{}.{ext}",
                params.info.ds_id,
                params.info.ds_name,
                range.start.format("%Y%m%d"),
                range.end.format("%Y%m%d"),
            );
            out.push(CdsRequest {
                product: params.product.clone(),
                product_type: params.product_type.clone(),
                region: region.clone(),
                bounds,
                variable: variable.clone(),
                range,
                times: params.times.clone(),
                data_format: params.data_format().to_string(),
                file_name,
            });
        }
    }
    ensure_unique_file_names("cds", &out)?;
    Ok(out)
}

/// One request per (forecast time, extension), forecast-time-major.
pub fn build_ecpds_requests(params: &EcpdsParams, run_date: NaiveDate) -> Result<Vec<EcpdsRequest>> {
    if params.forecast_times.is_empty() {
        return Err(Error::config("ecpds: no forecast_times configured"));
    }
    if params.extensions.is_empty() {
        return Err(Error::config("ecpds: no extensions configured"));
    }

    let base_url = params.base_url()?;
    let hour = parse_zulu_hour(&params.zulu_utc_timestamp)?;
    let run = run_datetime(run_date, hour)?;
    let stream = patch_stream(&params.forecast_type, &format!("{hour:02}"));

    let mut out = Vec::with_capacity(params.forecast_times.len() * params.extensions.len());
    for forecast_time in &params.forecast_times {
        let step = parse_forecast_step(forecast_time)?;
        for ext in &params.extensions {
            let url = format_url(
                &base_url,
                run,
                &params.model,
                &params.resolution,
                &stream,
                &params.data_type,
                step,
                ext,
            );
            out.push(EcpdsRequest {
                index_url: index_url(&url),
                url,
                run,
                forecast_time: forecast_time.clone(),
                step,
                extension: ext.clone(),
                file_name: format_file_name(run, &stream, &params.data_type, step, ext),
            });
        }
    }
    ensure_unique_file_names("ecpds", &out)?;
    Ok(out)
}

/// Two requests with the same file name would share a staging path.
fn ensure_unique_file_names<R: FetchRequest>(source: &str, requests: &[R]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for r in requests {
        if !seen.insert(r.file_name()) {
            return Err(Error::config(format!("{source}: duplicate request for {}", r.file_name())));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::config::tests::SAMPLE;
    use crate::date::{DateMode, resolve_date_range};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn current_month_scenario_yields_one_request_per_variable() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let cds = params.cds().unwrap();
        let range = resolve_date_range(DateMode::CurrentMonth, cds.start_date, cds.end_date, d(2024, 3, 15)).unwrap();
        let reqs = build_cds_requests(cds, range).unwrap();

        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].variable, "2m_temperature");
        assert_eq!(reqs[1].variable, "total_precipitation");
        for r in &reqs {
            assert_eq!(r.range.start, d(2024, 3, 1));
            assert_eq!(r.range.end, d(2024, 3, 31));
            assert_eq!(r.bounds, Bounds([19.0, 74.0, 11.0, 79.0]));
        }
        assert_eq!(reqs[0].file_name, "0001-era5-ka-2m_temperature-20240301-20240331.nc");
    }

    #[test]
    fn cds_cross_product_is_region_major() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let mut cds = params.cds().unwrap().clone();
        cds.regions = vec!["tn".into(), "ka".into()];
        cds.bounds.insert("tn".into(), Bounds([13.5, 76.0, 8.0, 80.5]));
        cds.variables.push("10m_u_component_of_wind".into());

        let range = DateRange::new(d(2024, 1, 30), d(2024, 2, 2)).unwrap();
        let reqs = build_cds_requests(&cds, range).unwrap();
        let labels: Vec<(String, String)> = reqs.iter().map(|r| (r.region.clone(), r.variable.clone())).collect();
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[0], ("tn".into(), "2m_temperature".into()));
        assert_eq!(labels[2], ("tn".into(), "10m_u_component_of_wind".into()));
        assert_eq!(labels[3], ("ka".into(), "2m_temperature".into()));

        let unique: BTreeSet<&str> = reqs.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(unique.len(), reqs.len());

        let inputs = reqs[0].inputs();
        assert_eq!(inputs["month"], json!(["01", "02"]));
        assert_eq!(inputs["day"], json!(["01", "02", "30", "31"]));
        assert_eq!(inputs["area"], json!([13.5, 76.0, 8.0, 80.5]));
    }

    #[test]
    fn cds_missing_bounds_or_variables_is_configuration_error() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 2)).unwrap();

        let mut cds = params.cds().unwrap().clone();
        cds.regions.push("xx".into());
        assert!(build_cds_requests(&cds, range).unwrap_err().is_configuration());

        let mut cds = params.cds().unwrap().clone();
        cds.variables.clear();
        assert!(build_cds_requests(&cds, range).unwrap_err().is_configuration());
    }

    #[test]
    fn ecpds_cross_product_is_forecast_time_major() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let ecpds = params.ecpds().unwrap();
        let reqs = build_ecpds_requests(ecpds, d(2024, 3, 15)).unwrap();

        let labels: Vec<String> = reqs.iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["0h/grib2", "0h/index", "6h/grib2", "6h/index"]);
        assert_eq!(reqs[2].file_name, "20240315000000-6h-oper-fc.grib2");
        assert_eq!(
            reqs[2].url,
            "https://data.ecmwf.int/forecasts/20240315/00z/ifs/0p25/oper/20240315000000-6h-oper-fc.grib2"
        );
        assert_eq!(reqs[2].index_url, reqs[3].url);
        assert!(reqs[3].is_index());
    }

    #[test]
    fn ecpds_empty_extensions_is_configuration_error() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let mut ecpds = params.ecpds().unwrap().clone();
        ecpds.extensions.clear();
        assert!(build_ecpds_requests(&ecpds, d(2024, 3, 15)).unwrap_err().is_configuration());
    }

    #[test]
    fn duplicate_targets_are_configuration_errors() {
        let params = Params::from_yaml_str(SAMPLE).unwrap();
        let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 2)).unwrap();

        let mut cds = params.cds().unwrap().clone();
        cds.variables = vec!["2m_temperature".into(), "2m_temperature".into()];
        assert!(build_cds_requests(&cds, range).unwrap_err().is_configuration());

        let mut cds = params.cds().unwrap().clone();
        cds.regions = vec!["ka".into(), "ka".into()];
        assert!(build_cds_requests(&cds, range).unwrap_err().is_configuration());

        let mut ecpds = params.ecpds().unwrap().clone();
        ecpds.forecast_times = vec!["6h".into(), "6".into()];
        assert!(build_ecpds_requests(&ecpds, d(2024, 3, 15)).unwrap_err().is_configuration());
    }
}
