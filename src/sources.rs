/// Built-in base URLs of the forecast distribution mirrors.
///
/// If `source` is already an `http(s)` URL, it is used as-is.
pub fn source_to_base_url(source: &str) -> Option<&'static str> {
    match source {
        "ecmwf" => Some("https://data.ecmwf.int/forecasts"),
        "azure" => Some("https://ai4edataeuwest.blob.core.windows.net/ecmwf"),
        "aws" => Some("https://ecmwf-forecasts.s3.eu-central-1.amazonaws.com"),
        "google" => Some("https://storage.googleapis.com/ecmwf-open-data"),
        "ecmwf-esuites" => Some("https://xdiss.ecmwf.int/ecpds/home/opendata"),
        _ => None,
    }
}

/// Default endpoint of the climate data store request/poll API.
pub const CDS_DEFAULT_URL: &str = "https://cds.climate.copernicus.eu/api";

pub fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Resolve a configured `source` (mirror name or URL) into a base URL without trailing slash.
pub fn resolve_base_url(source: &str) -> Option<String> {
    if is_http_url(source) {
        Some(source.trim_end_matches('/').to_string())
    } else {
        source_to_base_url(source).map(|s| s.to_string())
    }
}
