use chrono::{DateTime, Utc};

pub const FILE_PATTERN: &str = "{yyyymmddHHMMSS}-{step}h-{stream}-{type}.{ext}";
pub const HOURLY_PATTERN: &str = "{url}/{yyyymmdd}/{H}z/{model}/{resol}/{stream}/{file}";

pub const INDEX_EXTENSION: &str = "index";

/// 06z and 18z runs of the high resolution streams are published under the
/// short-cutoff stream names.
pub fn patch_stream(stream: &str, hour_2d: &str) -> String {
    match (stream, hour_2d) {
        ("oper", "06") | ("oper", "18") => "scda",
        ("wave", "06") | ("wave", "18") => "scwv",
        _ => stream,
    }
    .to_string()
}

/// Canonical file name of one forecast product.
pub fn format_file_name(run: DateTime<Utc>, stream: &str, typ: &str, step: u32, ext: &str) -> String {
    FILE_PATTERN
        .replace("{yyyymmddHHMMSS}", &run.format("%Y%m%d%H%M%S").to_string())
        .replace("{step}", &step.to_string())
        .replace("{stream}", stream)
        .replace("{type}", typ)
        .replace("{ext}", ext)
}

/// Canonical URL of one forecast product.
pub fn format_url(
    base_url: &str,
    run: DateTime<Utc>,
    model: &str,
    resol: &str,
    stream: &str,
    typ: &str,
    step: u32,
    ext: &str,
) -> String {
    HOURLY_PATTERN
        .replace("{url}", base_url)
        .replace("{yyyymmdd}", &run.format("%Y%m%d").to_string())
        .replace("{H}", &run.format("%H").to_string())
        .replace("{model}", model)
        .replace("{resol}", resol)
        .replace("{stream}", stream)
        .replace("{file}", &format_file_name(run, stream, typ, step, ext))
}

/// Companion index resource: same URL with the `index` extension.
pub fn index_url(url: &str) -> String {
    let base = url.rsplit_once('.').map(|(b, _)| b).unwrap_or(url);
    format!("{base}.{INDEX_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn patch_stream_infers_scda_scwv() {
        assert_eq!(patch_stream("oper", "00"), "oper");
        assert_eq!(patch_stream("oper", "06"), "scda");
        assert_eq!(patch_stream("wave", "18"), "scwv");
        assert_eq!(patch_stream("enfo", "06"), "enfo");
    }

    #[test]
    fn formats_canonical_url() {
        let run = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let url = format_url("https://data.ecmwf.int/forecasts", run, "ifs", "0p25", "oper", "fc", 6, "grib2");
        assert_eq!(
            url,
            "https://data.ecmwf.int/forecasts/20240315/00z/ifs/0p25/oper/20240315000000-6h-oper-fc.grib2"
        );
        assert_eq!(
            index_url(&url),
            "https://data.ecmwf.int/forecasts/20240315/00z/ifs/0p25/oper/20240315000000-6h-oper-fc.index"
        );
    }
}
