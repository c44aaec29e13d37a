//! Flat-table ingestion and egress.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::environment::{EnvironmentalRecord, VariableRecord};
use crate::resample::{elapsed_seconds, parse_depth_code, RawFix, Trajectory};
use crate::training::TrainingExample;
use crate::TrackError;

const MISSING_TOKENS: &[&str] = &["", "nan", "null", "na", "none"];

const LATITUDE_COLUMNS: &[&str] = &["latitude", "lat"];
const LONGITUDE_COLUMNS: &[&str] = &["longitude", "lon"];
const YEAR_COLUMNS: &[&str] = &["year"];
const TEMPERATURE_COLUMNS: &[&str] = &["temperature", "temperatura", "temp_media", "sst"];
const CHLOROPHYLL_COLUMNS: &[&str] =
    &["chlorophyll", "concentracion_clorofila", "cloro_media", "chlor_a"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variable {
    Temperature,
    Chlorophyll,
}

impl Variable {
    fn columns(self) -> &'static [&'static str] {
        match self {
            Variable::Temperature => TEMPERATURE_COLUMNS,
            Variable::Chlorophyll => CHLOROPHYLL_COLUMNS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrackRow {
    date: String,
    lon: String,
    lat: String,
    #[serde(default)]
    lc: Option<String>,
}

/// Parse the timestamp layouts seen in tracking exports; naive times are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Numeric field where the usual missing-value spellings read as `None`.
pub fn parse_optional_f64(raw: &str) -> Result<Option<f64>, String> {
    let trimmed = raw.trim();
    if MISSING_TOKENS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return Ok(None);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("'{}' is not a number", trimmed))?;
    Ok(value.is_finite().then_some(value))
}

fn parse_required_f64(raw: &str, column: &str) -> Result<f64, String> {
    parse_optional_f64(raw)?.ok_or_else(|| format!("{} is missing", column))
}

fn parse_year(raw: &str) -> Result<i32, String> {
    let trimmed = raw.trim();
    if let Ok(year) = trimmed.parse::<i32>() {
        return Ok(year);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => Ok(value as i32),
        _ => Err(format!("'{}' is not a year", trimmed)),
    }
}

fn open(path: &Path) -> Result<File, TrackError> {
    File::open(path)
        .map_err(|e| TrackError::SourceUnavailable(format!("{}: {}", path.display(), e)))
}

pub fn read_track_file(path: &Path) -> Result<Vec<RawFix>, TrackError> {
    read_track_csv(open(path)?).map_err(|err| match err {
        TrackError::SourceUnavailable(msg) => {
            TrackError::SourceUnavailable(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Read `date, lon, lat, lc` rows; any malformed row rejects the whole table.
pub fn read_track_csv<R: Read>(reader: R) -> Result<Vec<RawFix>, TrackError> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    let mut fixes = Vec::new();
    for (idx, row) in rdr.deserialize::<TrackRow>().enumerate() {
        let row = row.map_err(|e| TrackError::SourceUnavailable(e.to_string()))?;
        let invalid = |reason: String| TrackError::InvalidFix {
            row: idx + 1,
            reason,
        };
        let timestamp = parse_timestamp(&row.date)
            .ok_or_else(|| invalid(format!("unparseable date '{}'", row.date)))?;
        let lon = parse_required_f64(&row.lon, "lon").map_err(&invalid)?;
        let lat = parse_required_f64(&row.lat, "lat").map_err(&invalid)?;
        fixes.push(RawFix::new(timestamp, lon, lat, row.lc.unwrap_or_default()));
    }
    Ok(fixes)
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

fn require_column(headers: &StringRecord, names: &[&str]) -> Result<usize, TrackError> {
    find_column(headers, names).ok_or_else(|| {
        TrackError::SourceUnavailable(format!("missing column (expected one of {:?})", names))
    })
}

struct KeyColumns {
    lat: usize,
    lon: usize,
    year: usize,
}

impl KeyColumns {
    fn locate(headers: &StringRecord) -> Result<Self, TrackError> {
        Ok(Self {
            lat: require_column(headers, LATITUDE_COLUMNS)?,
            lon: require_column(headers, LONGITUDE_COLUMNS)?,
            year: require_column(headers, YEAR_COLUMNS)?,
        })
    }

    fn parse(&self, record: &StringRecord) -> Result<(f64, f64, i32), String> {
        let field = |idx: usize| record.get(idx).unwrap_or("");
        Ok((
            parse_required_f64(field(self.lat), "latitude")?,
            parse_required_f64(field(self.lon), "longitude")?,
            parse_year(field(self.year))?,
        ))
    }
}

fn optional_field(record: &StringRecord, idx: Option<usize>) -> Result<Option<f64>, String> {
    match idx {
        Some(idx) => parse_optional_f64(record.get(idx).unwrap_or("")),
        None => Ok(None),
    }
}

/// Ragged rows come back as records so they can be skipped one at a time.
fn lenient_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader)
}

fn check_width(record: &StringRecord, width: usize) -> Result<(), String> {
    if record.len() == width {
        Ok(())
    } else {
        Err(format!("expected {} fields, found {}", width, record.len()))
    }
}

#[derive(Default)]
struct RowSkips {
    count: usize,
    first_cause: Option<String>,
}

impl RowSkips {
    fn record(&mut self, row: usize, cause: String) {
        self.count += 1;
        self.first_cause
            .get_or_insert_with(|| format!("row {}: {}", row, cause));
    }
}

pub fn read_environment_file(path: &Path) -> Result<Vec<EnvironmentalRecord>, TrackError> {
    read_environment_csv(open(path)?)
}

/// Read a combined environmental table. Rows with unusable keys are skipped and counted.
pub fn read_environment_csv<R: Read>(reader: R) -> Result<Vec<EnvironmentalRecord>, TrackError> {
    let mut rdr = lenient_reader(reader);
    let headers = rdr.headers()?.clone();
    let keys = KeyColumns::locate(&headers)?;
    let temperature = find_column(&headers, TEMPERATURE_COLUMNS);
    let chlorophyll = find_column(&headers, CHLOROPHYLL_COLUMNS);
    if temperature.is_none() && chlorophyll.is_none() {
        return Err(TrackError::SourceUnavailable(
            "environmental table has neither a temperature nor a chlorophyll column".into(),
        ));
    }

    let mut out = Vec::new();
    let mut skips = RowSkips::default();
    for (idx, record) in rdr.records().enumerate() {
        let record = match record {
            Err(err) if err.is_io_error() => return Err(err.into()),
            other => other,
        };
        let parsed = record.map_err(|e| e.to_string()).and_then(|record| {
            check_width(&record, headers.len())?;
            let (latitude, longitude, year) = keys.parse(&record)?;
            Ok(EnvironmentalRecord {
                latitude,
                longitude,
                year,
                temperature: optional_field(&record, temperature)?,
                chlorophyll: optional_field(&record, chlorophyll)?,
            })
        });
        match parsed {
            Ok(row) => out.push(row),
            Err(cause) => skips.record(idx + 1, cause),
        }
    }
    if let Some(cause) = skips.first_cause.as_deref() {
        warn!(skipped = skips.count, first = cause, "skipped malformed environmental rows");
    }
    Ok(out)
}

pub fn read_variable_file(path: &Path, variable: Variable) -> Result<Vec<VariableRecord>, TrackError> {
    read_variable_csv(open(path)?, variable)
}

/// Read a single-variable table (`latitude, longitude, <variable>, year`).
pub fn read_variable_csv<R: Read>(
    reader: R,
    variable: Variable,
) -> Result<Vec<VariableRecord>, TrackError> {
    let mut rdr = lenient_reader(reader);
    let headers = rdr.headers()?.clone();
    let keys = KeyColumns::locate(&headers)?;
    let value = require_column(&headers, variable.columns())?;

    let mut out = Vec::new();
    let mut skips = RowSkips::default();
    for (idx, record) in rdr.records().enumerate() {
        let record = match record {
            Err(err) if err.is_io_error() => return Err(err.into()),
            other => other,
        };
        let parsed = record.map_err(|e| e.to_string()).and_then(|record| {
            check_width(&record, headers.len())?;
            let (latitude, longitude, year) = keys.parse(&record)?;
            Ok(VariableRecord {
                latitude,
                longitude,
                year,
                value: optional_field(&record, Some(value))?,
            })
        });
        match parsed {
            Ok(row) => out.push(row),
            Err(cause) => skips.record(idx + 1, cause),
        }
    }
    if let Some(cause) = skips.first_cause.as_deref() {
        warn!(skipped = skips.count, first = cause, ?variable, "skipped malformed rows");
    }
    Ok(out)
}

fn fmt_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn write_trajectories<W: Write>(
    trajectories: &[Trajectory],
    writer: W,
) -> Result<(), TrackError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([
        "elapsed_seconds",
        "longitude",
        "latitude",
        "depth_class",
        "entity_id",
        "year",
    ])?;
    for point in trajectories.iter().flat_map(|t| t.points.iter()) {
        wtr.write_record([
            point.elapsed_s.to_string(),
            point.longitude.to_string(),
            point.latitude.to_string(),
            point.depth_class.to_string(),
            point.entity_id.clone(),
            point.year.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_training<W: Write>(examples: &[TrainingExample], writer: W) -> Result<(), TrackError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([
        "longitude",
        "latitude",
        "temperature",
        "chlorophyll",
        "entity_id",
        "longitude_next",
        "latitude_next",
    ])?;
    for example in examples {
        wtr.write_record([
            example.longitude.to_string(),
            example.latitude.to_string(),
            fmt_optional(example.temperature),
            fmt_optional(example.chlorophyll),
            example.entity_id.clone(),
            example.longitude_next.to_string(),
            example.latitude_next.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_environment<W: Write>(
    records: &[EnvironmentalRecord],
    writer: W,
) -> Result<(), TrackError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["latitude", "longitude", "year", "temperature", "chlorophyll"])?;
    for record in records {
        wtr.write_record([
            record.latitude.to_string(),
            record.longitude.to_string(),
            record.year.to_string(),
            fmt_optional(record.temperature),
            fmt_optional(record.chlorophyll),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Per-file summary used by the `diagnose` command.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrackDiagnostics {
    pub rows: usize,
    pub parsed_rows: usize,
    pub first_error: Option<String>,
    pub distinct_timestamps: usize,
    pub timespan_s: Option<f64>,
    pub first_year: Option<i32>,
    pub depth_codes: BTreeMap<String, usize>,
    pub non_numeric_codes: usize,
}

/// Tolerant scan of a track table: unlike [`read_track_csv`], bad rows are counted, not fatal.
pub fn diagnose_track_csv<R: Read>(reader: R) -> Result<TrackDiagnostics, TrackError> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    let mut diag = TrackDiagnostics::default();
    let mut stamps: BTreeSet<DateTime<Utc>> = BTreeSet::new();

    for (idx, row) in rdr.deserialize::<TrackRow>().enumerate() {
        diag.rows += 1;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                diag.first_error.get_or_insert_with(|| format!("row {}: {}", idx + 1, err));
                continue;
            }
        };
        let timestamp = parse_timestamp(&row.date);
        let position = parse_required_f64(&row.lon, "lon")
            .and_then(|lon| parse_required_f64(&row.lat, "lat").map(|lat| (lon, lat)));
        match (timestamp, position) {
            (Some(ts), Ok(_)) => {
                diag.parsed_rows += 1;
                stamps.insert(ts);
            }
            (None, _) => {
                diag.first_error
                    .get_or_insert_with(|| format!("row {}: unparseable date '{}'", idx + 1, row.date));
            }
            (_, Err(reason)) => {
                diag.first_error
                    .get_or_insert_with(|| format!("row {}: {}", idx + 1, reason));
            }
        }
        let code = row.lc.unwrap_or_default();
        if parse_depth_code(&code).is_none() {
            diag.non_numeric_codes += 1;
        }
        *diag.depth_codes.entry(code).or_insert(0) += 1;
    }

    diag.distinct_timestamps = stamps.len();
    if let (Some(first), Some(last)) = (stamps.first(), stamps.last()) {
        diag.timespan_s = Some(elapsed_seconds(*last - *first));
        diag.first_year = Some(first.year());
    }
    Ok(diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn timestamp_layouts() {
        let expected = Utc.with_ymd_and_hms(2013, 6, 27, 15, 18, 0).unwrap();
        for raw in [
            "2013-06-27 15:18:00",
            "2013-06-27T15:18:00",
            "2013-06-27T15:18:00Z",
            "2013-06-27 15:18",
            "06/27/2013 15:18",
            "2013-06-27 17:18:00+02:00",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{}", raw);
        }
        let with_fraction = parse_timestamp("2013-06-27 15:18:00.250").unwrap();
        assert_eq!(with_fraction.nanosecond(), 250_000_000);
        assert_eq!(
            parse_timestamp("2013-06-27"),
            Some(Utc.with_ymd_and_hms(2013, 6, 27, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn missing_tokens() {
        assert_eq!(parse_optional_f64("NaN"), Ok(None));
        assert_eq!(parse_optional_f64("NULL"), Ok(None));
        assert_eq!(parse_optional_f64(" "), Ok(None));
        assert_eq!(parse_optional_f64("15.5"), Ok(Some(15.5)));
        assert!(parse_optional_f64("warm").is_err());
    }

    #[test]
    fn reads_unsorted_tracks_with_extra_columns() {
        let csv = "id,date,lon,lat,lc\n\
                   x,2013-06-02 00:00:00,-71.0,41.0,2\n\
                   x,2013-06-01 00:00:00,-71.5,41.2,A\n";
        let fixes = read_track_csv(csv.as_bytes()).unwrap();
        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[0].lon, -71.0);
        assert_eq!(fixes[1].lc, "A");
        assert_eq!(fixes[1].depth(), None);
    }

    #[test]
    fn malformed_track_row_rejects_table() {
        let csv = "date,lon,lat,lc\n2013-06-01 00:00:00,-71.0,41.0,1\nsoon,-71.0,41.0,1\n";
        let err = read_track_csv(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, TrackError::InvalidFix { row: 2, .. }));

        let csv = "date,lon,lat,lc\n2013-06-01 00:00:00,west,41.0,1\n";
        assert!(matches!(
            read_track_csv(csv.as_bytes()),
            Err(TrackError::InvalidFix { row: 1, .. })
        ));
    }

    #[test]
    fn missing_track_column_is_source_error() {
        let csv = "when,lon,lat\n2013-06-01,-71.0,41.0\n";
        assert!(matches!(
            read_track_csv(csv.as_bytes()),
            Err(TrackError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn missing_file_is_source_error() {
        let err = read_track_file(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, TrackError::SourceUnavailable(_)));
    }

    #[test]
    fn environment_aliases_and_missing_values() {
        let csv = "latitude,longitude,concentracion_clorofila,year,temperatura\n\
                   41.2,-71.5,0.5,2013,15.5\n\
                   41.3,-71.5,NaN,2013,\n\
                   bad,-71.5,0.1,2013,1.0\n\
                   41.4,-71.5,0.2,2014.0,NULL\n";
        let rows = read_environment_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].chlorophyll, Some(0.5));
        assert_eq!(rows[0].temperature, Some(15.5));
        assert_eq!(rows[1].chlorophyll, None);
        assert_eq!(rows[1].temperature, None);
        assert_eq!(rows[2].year, 2014);
    }

    #[test]
    fn ragged_and_non_utf8_rows_are_skipped() {
        let csv = b"latitude,longitude,year,temperature,chlorophyll\n\
                    41.2,-71.5,2013,15.5,0.5\n\
                    41.3,-71.4,2013,16.0\n\
                    41.4,-71.3,2013,\xff,0.2\n\
                    41.5,-71.2,2013,17.0,0.3\n";
        let rows = read_environment_csv(&csv[..]).unwrap();
        let kept: Vec<(f64, Option<f64>)> = rows.iter().map(|r| (r.latitude, r.temperature)).collect();
        assert_eq!(kept, vec![(41.2, Some(15.5)), (41.5, Some(17.0))]);

        let csv = b"lat,lon,chlor_a,year\n\
                    41.2,-71.5,0.5,2013\n\
                    41.3,-71.4\n\
                    41.4,-71.3,\xff,2013\n\
                    41.5,-71.2,0.3,2013\n";
        let rows = read_variable_csv(&csv[..], Variable::Chlorophyll).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value, Some(0.3));
    }

    #[test]
    fn environment_without_values_is_rejected() {
        let csv = "latitude,longitude,year\n1,2,2013\n";
        assert!(read_environment_csv(csv.as_bytes()).is_err());
    }

    #[test]
    fn variable_table() {
        let csv = "lat,lon,sst,year\n41.2,-71.5,15.5,2013\n";
        let rows = read_variable_csv(csv.as_bytes(), Variable::Temperature).unwrap();
        assert_eq!(rows[0].value, Some(15.5));
        assert!(read_variable_csv(csv.as_bytes(), Variable::Chlorophyll).is_err());
    }

    #[test]
    fn training_writer_leaves_missing_blank() {
        let examples = vec![TrainingExample {
            longitude: -71.5,
            latitude: 41.2,
            temperature: None,
            chlorophyll: Some(0.5),
            entity_id: "A".into(),
            longitude_next: -71.4,
            latitude_next: 41.3,
        }];
        let mut buf = Vec::new();
        write_training(&examples, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "longitude,latitude,temperature,chlorophyll,entity_id,longitude_next,latitude_next\n\
             -71.5,41.2,,0.5,A,-71.4,41.3\n"
        );
    }

    #[test]
    fn environment_round_trips_through_writer() {
        let records = vec![EnvironmentalRecord {
            latitude: 41.2,
            longitude: -71.5,
            year: 2013,
            temperature: Some(15.5),
            chlorophyll: None,
        }];
        let mut buf = Vec::new();
        write_environment(&records, &mut buf).unwrap();
        let back = read_environment_csv(buf.as_slice()).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn diagnostics_count_codes_and_errors() {
        let csv = "date,lon,lat,lc\n\
                   2013-06-01 00:00:00,-71.0,41.0,2\n\
                   2013-06-01 00:00:00,-71.0,41.0,A\n\
                   2013-06-02 00:00:00,-70.0,41.0,B\n\
                   later,-70.0,41.0,B\n";
        let diag = diagnose_track_csv(csv.as_bytes()).unwrap();
        assert_eq!(diag.rows, 4);
        assert_eq!(diag.parsed_rows, 3);
        assert_eq!(diag.distinct_timestamps, 2);
        assert_eq!(diag.timespan_s, Some(86_400.0));
        assert_eq!(diag.first_year, Some(2013));
        assert_eq!(diag.depth_codes.get("B"), Some(&2));
        assert_eq!(diag.non_numeric_codes, 3);
        assert!(diag.first_error.unwrap().starts_with("row 4"));
    }
}
