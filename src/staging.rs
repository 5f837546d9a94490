use crate::db::models::{FinalFlightUpdate, NewFlight, NewMetar, NewSkyLayer, NewTaf};
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

/// Default failure threshold - fail a batch if more than 10% of its records
/// fail to parse
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

/// At most four cloud layers are kept per record.
const MAX_SKY_LAYERS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_records: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        self.failure_rate = if self.total_records > 0 {
            self.parse_failures as f64 / self.total_records as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

/// Read one staged batch file: a JSON array of collector documents.
pub fn read_batch_file<P: AsRef<Path>>(path: P) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let parsed: Value = serde_json::from_str(&content)
        .map_err(|e| AppError::Parse(format!("Invalid JSON batch: {}", e)))?;

    match parsed {
        Value::Array(docs) => Ok(docs),
        _ => Err(AppError::Parse(
            "Staged batch must be a JSON array of documents".to_string(),
        )),
    }
}

fn parse_docs<T>(
    docs: &[Value],
    threshold: f64,
    what: &str,
    parse_one: impl Fn(&Value) -> Result<T>,
) -> Result<(Vec<T>, ParseStats)> {
    let mut records = Vec::new();
    let mut stats = ParseStats::new();

    for (idx, doc) in docs.iter().enumerate() {
        stats.total_records += 1;
        match parse_one(doc) {
            Ok(record) => {
                records.push(record);
                stats.parsed_successfully += 1;
            }
            Err(e) => {
                stats.parse_failures += 1;
                warn!("Failed to parse {} document {}: {}", what, idx, e);
            }
        }
    }

    stats.finalize();

    if stats.exceeds_threshold(threshold) {
        return Err(AppError::Parse(format!(
            "{} parse failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} records",
            what,
            stats.failure_rate * 100.0,
            threshold * 100.0,
            stats.parse_failures,
            stats.total_records
        )));
    }

    Ok((records, stats))
}

pub fn parse_metar_docs(docs: &[Value], threshold: f64) -> Result<(Vec<NewMetar>, ParseStats)> {
    parse_docs(docs, threshold, "METAR", parse_metar_doc)
}

pub fn parse_taf_docs(docs: &[Value], threshold: f64) -> Result<(Vec<NewTaf>, ParseStats)> {
    parse_docs(docs, threshold, "TAF", parse_taf_doc)
}

pub fn parse_flight_docs(docs: &[Value], threshold: f64) -> Result<(Vec<NewFlight>, ParseStats)> {
    parse_docs(docs, threshold, "flight", parse_flight_doc)
}

pub fn parse_final_docs(
    docs: &[Value],
    threshold: f64,
) -> Result<(Vec<FinalFlightUpdate>, ParseStats)> {
    parse_docs(docs, threshold, "final flight", parse_final_doc)
}

// ---------------------------------------------------------------------------
// Field extraction helpers
//
// Collector documents come from XML-derived JSON; attribute fields may or may
// not carry an '@' prefix depending on the collector version, and numeric
// fields sometimes arrive as strings with stray units.
// ---------------------------------------------------------------------------

fn get_field<'a>(doc: &'a Value, name: &str) -> Option<&'a Value> {
    doc.get(format!("@{}", name))
        .or_else(|| doc.get(name))
        .filter(|v| !v.is_null())
}

fn clean_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(other) if !other.is_null() => Some(other.to_string()),
        _ => None,
    }
}

fn clean_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() || cleaned == "-" {
                None
            } else {
                cleaned.parse().ok()
            }
        }
        _ => None,
    }
}

fn clean_i32(value: Option<&Value>) -> Option<i32> {
    match value {
        Some(Value::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            if cleaned.is_empty() || cleaned == "-" {
                None
            } else {
                cleaned.parse().ok()
            }
        }
        _ => None,
    }
}

/// Parse the handful of timestamp shapes the collector emits.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let cleaned = raw.trim_end_matches('Z');
    let cleaned = cleaned.split('.').next().unwrap_or(cleaned);

    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y%m%d_%H%M%S",
        "%Y-%m-%dT%H:%M",
    ];

    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(naive.and_utc());
        }
    }

    None
}

fn get_timestamp(doc: &Value, name: &str) -> Option<DateTime<Utc>> {
    clean_string(get_field(doc, name)).and_then(|s| parse_timestamp(&s))
}

fn required_string(doc: &Value, name: &str) -> Result<String> {
    clean_string(get_field(doc, name))
        .ok_or_else(|| AppError::Parse(format!("Missing required field '{}'", name)))
}

/// Pull cloud layers out of a weather document. TAF documents nest them
/// under the forecast prefix.
fn extract_sky_layers(doc: &Value, prefix: &str) -> Vec<NewSkyLayer> {
    let field = format!("{}sky_condition", prefix);
    let mut layers = Vec::new();

    match doc.get(&field) {
        Some(Value::Array(conditions)) => {
            for (idx, condition) in conditions.iter().take(MAX_SKY_LAYERS).enumerate() {
                if let Some(sky_cover) = clean_string(get_field(condition, "sky_cover")) {
                    layers.push(NewSkyLayer {
                        sky_cover,
                        cloud_base_ft_agl: clean_i32(get_field(condition, "cloud_base_ft_agl")),
                        cloud_type: clean_string(get_field(condition, "cloud_type")),
                        condition_order: (idx + 1) as i32,
                    });
                }
            }
        }
        _ => {
            // flattened single-layer form
            let sky_cover = clean_string(get_field(doc, &format!("{}sky_condition_sky_cover", prefix)));
            if let Some(sky_cover) = sky_cover {
                layers.push(NewSkyLayer {
                    sky_cover,
                    cloud_base_ft_agl: clean_i32(get_field(
                        doc,
                        &format!("{}sky_condition_cloud_base_ft_agl", prefix),
                    )),
                    cloud_type: clean_string(get_field(
                        doc,
                        &format!("{}sky_condition_cloud_type", prefix),
                    )),
                    condition_order: 1,
                });
            }
        }
    }

    layers
}

fn parse_metar_doc(doc: &Value) -> Result<NewMetar> {
    let external_id = clean_string(doc.get("_id").filter(|v| !v.is_null()))
        .or_else(|| clean_string(get_field(doc, "external_id")))
        .ok_or_else(|| AppError::Parse("Missing METAR external id".to_string()))?;
    let station_id = required_string(doc, "station_id")?;
    let observation_time = get_timestamp(doc, "observation_time")
        .ok_or_else(|| AppError::Parse("Missing or invalid METAR observation_time".to_string()))?;

    Ok(NewMetar {
        external_id,
        station_id,
        observation_time,
        raw_text: clean_string(get_field(doc, "raw_text")).unwrap_or_default(),
        temp_c: clean_f64(get_field(doc, "temp_c")),
        dewpoint_c: clean_f64(get_field(doc, "dewpoint_c")),
        wind_dir_degrees: clean_i32(get_field(doc, "wind_dir_degrees")),
        wind_speed_kt: clean_i32(get_field(doc, "wind_speed_kt")),
        wind_gust_kt: clean_i32(get_field(doc, "wind_gust_kt")),
        visibility_statute_mi: clean_f64(get_field(doc, "visibility_statute_mi")),
        altim_in_hg: clean_f64(get_field(doc, "altim_in_hg")),
        sea_level_pressure_mb: clean_f64(get_field(doc, "sea_level_pressure_mb")),
        flight_category: clean_string(get_field(doc, "flight_category")),
        metar_type: clean_string(get_field(doc, "metar_type")),
        precip_in: clean_f64(get_field(doc, "precip_in")),
        vert_vis_ft: clean_i32(get_field(doc, "vert_vis_ft")),
        wx_string: clean_string(get_field(doc, "wx_string")),
        sky_conditions: extract_sky_layers(doc, ""),
    })
}

fn parse_taf_doc(doc: &Value) -> Result<NewTaf> {
    let external_id = clean_string(doc.get("_id").filter(|v| !v.is_null()))
        .or_else(|| clean_string(get_field(doc, "external_id")))
        .ok_or_else(|| AppError::Parse("Missing TAF external id".to_string()))?;
    let station_id = required_string(doc, "station_id")?;

    Ok(NewTaf {
        external_id,
        station_id,
        issue_time: get_timestamp(doc, "issue_time"),
        bulletin_time: get_timestamp(doc, "bulletin_time"),
        valid_time_from: get_timestamp(doc, "valid_time_from"),
        valid_time_to: get_timestamp(doc, "valid_time_to"),
        fcst_time_from: get_timestamp(doc, "forecast_fcst_time_from"),
        fcst_time_to: get_timestamp(doc, "forecast_fcst_time_to"),
        change_indicator: clean_string(get_field(doc, "forecast_change_indicator")),
        probability: clean_i32(get_field(doc, "forecast_probability")),
        wind_dir_degrees: clean_i32(get_field(doc, "forecast_wind_dir_degrees")),
        wind_speed_kt: clean_i32(get_field(doc, "forecast_wind_speed_kt")),
        wind_gust_kt: clean_i32(get_field(doc, "forecast_wind_gust_kt")),
        visibility_statute_mi: clean_f64(get_field(doc, "forecast_visibility_statute_mi")),
        vert_vis_ft: clean_i32(get_field(doc, "forecast_vert_vis_ft")),
        wx_string: clean_string(get_field(doc, "forecast_wx_string")),
        raw_text: clean_string(get_field(doc, "raw_text")).unwrap_or_default(),
        sky_conditions: extract_sky_layers(doc, "forecast_"),
    })
}

fn leg_timestamp(doc: &Value, leg: &str, field: &str) -> Option<DateTime<Utc>> {
    doc.get(leg).and_then(|l| get_timestamp(l, field))
}

fn leg_string(doc: &Value, leg: &str, field: &str) -> Option<String> {
    doc.get(leg).and_then(|l| clean_string(get_field(l, field)))
}

/// Departure delay in minutes, when both the scheduled and actual instants
/// are known. Signed: early departures come out negative.
fn departure_delay_minutes(doc: &Value) -> Option<i32> {
    let scheduled = leg_timestamp(doc, "departure", "scheduled_utc")?;
    let actual = leg_timestamp(doc, "departure", "actual_utc")?;
    let minutes = (actual - scheduled).num_minutes();
    i32::try_from(minutes).ok()
}

fn parse_flight_doc(doc: &Value) -> Result<NewFlight> {
    let flight_number = required_string(doc, "flight_number")?;
    let from_airport = required_string(doc, "from_code")?;
    let to_airport = required_string(doc, "to_code")?;
    let departure_scheduled_utc = leg_timestamp(doc, "departure", "scheduled_utc")
        .ok_or_else(|| AppError::Parse("Missing departure scheduled_utc".to_string()))?;

    // airline is the two-letter prefix of the flight number; counted in
    // chars so a multibyte carrier code cannot split a codepoint
    let airline_code = if flight_number.chars().count() >= 2 {
        Some(flight_number.chars().take(2).collect())
    } else {
        None
    };

    Ok(NewFlight {
        flight_number,
        from_airport,
        to_airport,
        airline_code,
        aircraft_code: clean_string(get_field(doc, "aircraft_code")),
        operated_by: clean_string(get_field(doc, "operated_by")),
        departure_scheduled_utc,
        departure_actual_utc: leg_timestamp(doc, "departure", "estimated_utc")
            .or_else(|| leg_timestamp(doc, "departure", "actual_utc")),
        departure_terminal: leg_string(doc, "departure", "terminal"),
        departure_gate: leg_string(doc, "departure", "gate"),
        arrival_scheduled_utc: leg_timestamp(doc, "arrival", "scheduled_utc"),
        arrival_actual_utc: leg_timestamp(doc, "arrival", "estimated_utc")
            .or_else(|| leg_timestamp(doc, "arrival", "actual_utc")),
        arrival_terminal: leg_string(doc, "arrival", "terminal"),
        arrival_gate: leg_string(doc, "arrival", "gate"),
        status: clean_string(get_field(doc, "status")),
        delay_min: departure_delay_minutes(doc),
        departure_metar_fk: None,
        arrival_taf_fk: None,
    })
}

fn parse_final_doc(doc: &Value) -> Result<FinalFlightUpdate> {
    let flight_number = required_string(doc, "flight_number")?;
    let from_airport = required_string(doc, "from_code")?;
    let to_airport = required_string(doc, "to_code")?;
    let departure_scheduled_utc = leg_timestamp(doc, "departure", "scheduled_utc")
        .ok_or_else(|| AppError::Parse("Missing departure scheduled_utc".to_string()))?;

    let delay_min = doc
        .get("arrival")
        .and_then(|a| a.get("delay"))
        .and_then(|d| clean_i32(get_field(d, "minutes")))
        .or_else(|| departure_delay_minutes(doc));

    Ok(FinalFlightUpdate {
        flight_number,
        from_airport,
        to_airport,
        departure_scheduled_utc,
        departure_final_utc: leg_timestamp(doc, "departure", "actual_utc")
            .or_else(|| leg_timestamp(doc, "departure", "estimated_utc")),
        arrival_actual_utc: leg_timestamp(doc, "arrival", "actual_utc")
            .or_else(|| leg_timestamp(doc, "arrival", "estimated_utc")),
        status_final: clean_string(get_field(doc, "status")),
        delay_min,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        for raw in [
            "2025-01-01T10:00:00Z",
            "2025-01-01T10:00:00",
            "2025-01-01 10:00:00",
            "20250101_100000",
            "2025-01-01T10:00",
            "2025-01-01T10:00:00.123Z",
        ] {
            let parsed = parse_timestamp(raw);
            assert!(parsed.is_some(), "should parse '{}'", raw);
            assert_eq!(
                parsed.unwrap().format("%Y-%m-%d %H:%M").to_string(),
                "2025-01-01 10:00"
            );
        }

        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_clean_numeric_values() {
        assert_eq!(clean_f64(Some(&json!(12.5))), Some(12.5));
        assert_eq!(clean_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(clean_f64(Some(&json!("12.5 mi"))), Some(12.5));
        assert_eq!(clean_f64(Some(&json!(""))), None);
        assert_eq!(clean_i32(Some(&json!("270 deg"))), Some(270));
        assert_eq!(clean_i32(Some(&json!("-"))), None);
        assert_eq!(clean_i32(None), None);
    }

    #[test]
    fn test_parse_metar_doc_with_attribute_prefix() {
        let doc = json!({
            "_id": "metar-LFPG-001",
            "@station_id": "LFPG",
            "@observation_time": "2025-01-01T09:50:00Z",
            "@raw_text": "LFPG 010950Z 24010KT 9999 BKN040 08/05 Q1015",
            "@temp_c": "8.0",
            "@wind_speed_kt": 10,
            "sky_condition": [
                {"@sky_cover": "BKN", "@cloud_base_ft_agl": "4000"}
            ]
        });

        let metar = parse_metar_doc(&doc).unwrap();
        assert_eq!(metar.external_id, "metar-LFPG-001");
        assert_eq!(metar.station_id, "LFPG");
        assert_eq!(metar.temp_c, Some(8.0));
        assert_eq!(metar.wind_speed_kt, Some(10));
        assert_eq!(metar.sky_conditions.len(), 1);
        assert_eq!(metar.sky_conditions[0].sky_cover, "BKN");
        assert_eq!(metar.sky_conditions[0].cloud_base_ft_agl, Some(4000));
    }

    #[test]
    fn test_sky_layers_capped_at_four() {
        let doc = json!({
            "_id": "m1",
            "station_id": "LFPG",
            "observation_time": "2025-01-01T09:50:00Z",
            "sky_condition": [
                {"sky_cover": "FEW", "cloud_base_ft_agl": 1000},
                {"sky_cover": "SCT", "cloud_base_ft_agl": 2000},
                {"sky_cover": "BKN", "cloud_base_ft_agl": 3000},
                {"sky_cover": "OVC", "cloud_base_ft_agl": 4000},
                {"sky_cover": "OVC", "cloud_base_ft_agl": 5000}
            ]
        });

        let metar = parse_metar_doc(&doc).unwrap();
        assert_eq!(metar.sky_conditions.len(), 4);
        assert_eq!(metar.sky_conditions[3].condition_order, 4);
    }

    #[test]
    fn test_parse_taf_doc_segment() {
        let doc = json!({
            "_id": "taf-KJFK-007",
            "station_id": "KJFK",
            "issue_time": "2025-01-01T12:00:00Z",
            "valid_time_from": "2025-01-01T14:00:00Z",
            "valid_time_to": "2025-01-02T14:00:00Z",
            "forecast_fcst_time_from": "2025-01-01T16:00:00Z",
            "forecast_fcst_time_to": "2025-01-01T20:00:00Z",
            "forecast_change_indicator": "BECMG",
            "forecast_wind_speed_kt": "15",
            "forecast_sky_condition": [
                {"sky_cover": "OVC", "cloud_base_ft_agl": 800}
            ]
        });

        let taf = parse_taf_doc(&doc).unwrap();
        assert_eq!(taf.change_indicator.as_deref(), Some("BECMG"));
        assert_eq!(taf.wind_speed_kt, Some(15));
        assert!(taf.fcst_time_from.is_some());
        assert_eq!(taf.sky_conditions.len(), 1);
    }

    #[test]
    fn test_parse_flight_doc() {
        let doc = json!({
            "flight_number": "AF001",
            "from_code": "CDG",
            "to_code": "JFK",
            "status": "Scheduled",
            "departure": {
                "scheduled_utc": "2025-01-01T10:00:00Z",
                "terminal": "2E",
                "gate": "K41"
            },
            "arrival": {
                "scheduled_utc": "2025-01-01T17:00:00Z"
            }
        });

        let flight = parse_flight_doc(&doc).unwrap();
        assert_eq!(flight.airline_code.as_deref(), Some("AF"));
        assert_eq!(flight.departure_terminal.as_deref(), Some("2E"));
        assert!(flight.arrival_scheduled_utc.is_some());
        assert!(flight.departure_metar_fk.is_none());
    }

    #[test]
    fn test_airline_code_from_multibyte_flight_number() {
        let doc = json!({
            "flight_number": "Aé1",
            "from_code": "CDG",
            "to_code": "JFK",
            "departure": {"scheduled_utc": "2025-01-01T10:00:00Z"}
        });

        let flight = parse_flight_doc(&doc).unwrap();
        assert_eq!(flight.airline_code.as_deref(), Some("Aé"));

        // single-char numbers carry no airline code but still parse
        let doc = json!({
            "flight_number": "é",
            "from_code": "CDG",
            "to_code": "JFK",
            "departure": {"scheduled_utc": "2025-01-01T10:00:00Z"}
        });
        let flight = parse_flight_doc(&doc).unwrap();
        assert!(flight.airline_code.is_none());

        // and a whole batch of them never aborts the run
        let docs = vec![json!({
            "flight_number": "Aé1",
            "from_code": "CDG",
            "to_code": "JFK",
            "departure": {"scheduled_utc": "2025-01-01T10:00:00Z"}
        })];
        let (flights, stats) = parse_flight_docs(&docs, DEFAULT_FAILURE_THRESHOLD).unwrap();
        assert_eq!(flights.len(), 1);
        assert_eq!(stats.parse_failures, 0);
    }

    #[test]
    fn test_parse_final_doc_prefers_arrival_delay() {
        let doc = json!({
            "flight_number": "AF001",
            "from_code": "CDG",
            "to_code": "JFK",
            "status": "Landed",
            "departure": {
                "scheduled_utc": "2025-01-01T10:00:00Z",
                "actual_utc": "2025-01-01T10:12:00Z"
            },
            "arrival": {
                "actual_utc": "2025-01-01T17:25:00Z",
                "delay": {"minutes": 25}
            }
        });

        let update = parse_final_doc(&doc).unwrap();
        assert_eq!(update.delay_min, Some(25));
        assert_eq!(update.status_final.as_deref(), Some("Landed"));
        assert!(update.departure_final_utc.is_some());
    }

    #[test]
    fn test_batch_threshold_rejects_bad_batch() {
        let docs = vec![
            json!({"bogus": true}),
            json!({"also": "bogus"}),
            json!({
                "_id": "m1",
                "station_id": "LFPG",
                "observation_time": "2025-01-01T09:50:00Z"
            }),
        ];

        let result = parse_metar_docs(&docs, DEFAULT_FAILURE_THRESHOLD);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds threshold"));
    }

    #[test]
    fn test_batch_tolerates_failures_under_threshold() {
        let mut docs = vec![json!({"bogus": true})];
        for i in 0..20 {
            docs.push(json!({
                "_id": format!("m{}", i),
                "station_id": "LFPG",
                "observation_time": "2025-01-01T09:50:00Z"
            }));
        }

        let (metars, stats) = parse_metar_docs(&docs, DEFAULT_FAILURE_THRESHOLD).unwrap();
        assert_eq!(metars.len(), 20);
        assert_eq!(stats.parse_failures, 1);
    }
}
