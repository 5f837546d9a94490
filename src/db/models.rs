use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Ledger row for a staged collector batch that has been ingested.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessedBatch {
    pub id: i32,
    pub batch_name: String,
    pub kind: String,
    pub records_read: i32,
    pub records_loaded: i32,
    pub parse_failures: i32,
    pub processing_status: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProcessedBatch {
    pub batch_name: String,
    pub kind: String,
    pub records_read: i32,
    pub records_loaded: i32,
    pub parse_failures: i32,
    pub processing_status: String,
}

/// One cloud layer attached to a METAR or TAF record, before the parent id
/// is known.
#[derive(Debug, Clone)]
pub struct NewSkyLayer {
    pub sky_cover: String,
    pub cloud_base_ft_agl: Option<i32>,
    pub cloud_type: Option<String>,
    pub condition_order: i32,
}

/// Enforces the single-parent invariant: a sky_condition row belongs to
/// exactly one of metar/taf, with a layer order in 1..=4.
pub fn validate_sky_condition(
    metar_fk: Option<i64>,
    taf_fk: Option<i64>,
    condition_order: i32,
) -> Result<()> {
    match (metar_fk, taf_fk) {
        (Some(_), Some(_)) => Err(AppError::InvalidData(
            "sky_condition cannot reference both a METAR and a TAF".to_string(),
        )),
        (None, None) => Err(AppError::InvalidData(
            "sky_condition must reference either a METAR or a TAF".to_string(),
        )),
        _ if !(1..=4).contains(&condition_order) => Err(AppError::InvalidData(format!(
            "sky_condition condition_order {} out of range 1..=4",
            condition_order
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct NewMetar {
    pub external_id: String,
    pub station_id: String,
    pub observation_time: DateTime<Utc>,
    pub raw_text: String,
    pub temp_c: Option<f64>,
    pub dewpoint_c: Option<f64>,
    pub wind_dir_degrees: Option<i32>,
    pub wind_speed_kt: Option<i32>,
    pub wind_gust_kt: Option<i32>,
    pub visibility_statute_mi: Option<f64>,
    pub altim_in_hg: Option<f64>,
    pub sea_level_pressure_mb: Option<f64>,
    pub flight_category: Option<String>,
    pub metar_type: Option<String>,
    pub precip_in: Option<f64>,
    pub vert_vis_ft: Option<i32>,
    pub wx_string: Option<String>,
    pub sky_conditions: Vec<NewSkyLayer>,
}

/// One TAF forecast segment. A bulletin yields several of these, all sharing
/// the bulletin validity window but each with its own fcst window and change
/// indicator.
#[derive(Debug, Clone)]
pub struct NewTaf {
    pub external_id: String,
    pub station_id: String,
    pub issue_time: Option<DateTime<Utc>>,
    pub bulletin_time: Option<DateTime<Utc>>,
    pub valid_time_from: Option<DateTime<Utc>>,
    pub valid_time_to: Option<DateTime<Utc>>,
    pub fcst_time_from: Option<DateTime<Utc>>,
    pub fcst_time_to: Option<DateTime<Utc>>,
    pub change_indicator: Option<String>,
    pub probability: Option<i32>,
    pub wind_dir_degrees: Option<i32>,
    pub wind_speed_kt: Option<i32>,
    pub wind_gust_kt: Option<i32>,
    pub visibility_statute_mi: Option<f64>,
    pub vert_vis_ft: Option<i32>,
    pub wx_string: Option<String>,
    pub raw_text: String,
    pub sky_conditions: Vec<NewSkyLayer>,
}

/// Candidate row for departure matching; just enough to rank by proximity.
#[derive(Debug, Clone, FromRow)]
pub struct MetarRef {
    pub id: i64,
    pub external_id: String,
    pub station_id: String,
    pub observation_time: DateTime<Utc>,
}

/// Candidate segment for arrival matching. Only segments with a known
/// fcst_time_from qualify; an absent fcst_time_to means open-ended.
#[derive(Debug, Clone, FromRow)]
pub struct TafSegmentRef {
    pub id: i64,
    pub external_id: String,
    pub station_id: String,
    pub fcst_time_from: DateTime<Utc>,
    pub fcst_time_to: Option<DateTime<Utc>>,
    pub change_indicator: Option<String>,
    pub probability: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewFlight {
    pub flight_number: String,
    pub from_airport: String,
    pub to_airport: String,
    pub airline_code: Option<String>,
    pub aircraft_code: Option<String>,
    pub operated_by: Option<String>,
    pub departure_scheduled_utc: DateTime<Utc>,
    pub departure_actual_utc: Option<DateTime<Utc>>,
    pub departure_terminal: Option<String>,
    pub departure_gate: Option<String>,
    pub arrival_scheduled_utc: Option<DateTime<Utc>>,
    pub arrival_actual_utc: Option<DateTime<Utc>>,
    pub arrival_terminal: Option<String>,
    pub arrival_gate: Option<String>,
    pub status: Option<String>,
    pub delay_min: Option<i32>,
    pub departure_metar_fk: Option<i64>,
    pub arrival_taf_fk: Option<i64>,
}

impl NewFlight {
    /// The instant departure matching is anchored on.
    pub fn departure_instant(&self) -> DateTime<Utc> {
        self.departure_actual_utc
            .unwrap_or(self.departure_scheduled_utc)
    }

    /// The instant arrival matching is anchored on, when known.
    pub fn arrival_instant(&self) -> Option<DateTime<Utc>> {
        self.arrival_actual_utc.or(self.arrival_scheduled_utc)
    }
}

/// "Past flights" pass payload, keyed on the flight natural key.
#[derive(Debug, Clone)]
pub struct FinalFlightUpdate {
    pub flight_number: String,
    pub from_airport: String,
    pub to_airport: String,
    pub departure_scheduled_utc: DateTime<Utc>,
    pub departure_final_utc: Option<DateTime<Utc>>,
    pub arrival_actual_utc: Option<DateTime<Utc>>,
    pub status_final: Option<String>,
    pub delay_min: Option<i32>,
}

/// The completion fields of an already-inserted flight row.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct FlightCompletion {
    pub departure_final_utc: Option<DateTime<Utc>>,
    pub arrival_actual_utc: Option<DateTime<Utc>>,
    pub status_final: Option<String>,
    pub delay_min: Option<i32>,
}

/// Merge a final-pass update into the existing completion state.
///
/// Monotonic completion: a field already set is never blanked by an update
/// that lacks it. Returns the merged state plus the number of suppressed
/// stale overwrites (fields the update would have erased).
pub fn merge_final_update(
    existing: &FlightCompletion,
    update: &FinalFlightUpdate,
) -> (FlightCompletion, usize) {
    let mut stale = 0;

    let departure_final_utc = match (update.departure_final_utc, existing.departure_final_utc) {
        (None, Some(prev)) => {
            stale += 1;
            Some(prev)
        }
        (new, prev) => new.or(prev),
    };
    let arrival_actual_utc = match (update.arrival_actual_utc, existing.arrival_actual_utc) {
        (None, Some(prev)) => {
            stale += 1;
            Some(prev)
        }
        (new, prev) => new.or(prev),
    };
    let status_final = match (&update.status_final, &existing.status_final) {
        (None, Some(prev)) => {
            stale += 1;
            Some(prev.clone())
        }
        (new, prev) => new.clone().or_else(|| prev.clone()),
    };
    let delay_min = match (update.delay_min, existing.delay_min) {
        (None, Some(prev)) => {
            stale += 1;
            Some(prev)
        }
        (new, prev) => new.or(prev),
    };

    (
        FlightCompletion {
            departure_final_utc,
            arrival_actual_utc,
            status_final,
            delay_min,
        },
        stale,
    )
}

/// Prediction write-back from the downstream scoring step.
#[derive(Debug, Clone)]
pub struct FlightPrediction {
    pub flight_id: i64,
    pub delay_prob: f64,
    pub delay_risk_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(i64),
    AlreadyPresent(i64),
}

/// What applying a final-pass update did to the fact table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalUpdateOutcome {
    /// The natural key was unknown and a new row was created.
    pub inserted: bool,
    /// Fields the update would have blanked but monotonic completion kept.
    pub stale_suppressed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WeatherLoadResult {
    pub inserted: usize,
    pub duplicates: usize,
    pub sky_inserted: usize,
    pub sky_rejected: usize,
}

// ---------------------------------------------------------------------------
// Dimension rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct CountryDim {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub source_name: Option<String>,
    pub match_score: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AirlineDim {
    pub id: i64,
    pub source_id: i64,
    pub name: String,
    pub iata: Option<String>,
    pub icao: Option<String>,
    pub country_code: Option<String>,
    pub fleet_avg_age: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AirportDim {
    pub id: i64,
    pub iata: String,
    pub icao: String,
    pub name: String,
    pub country_code: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RouteDim {
    pub id: i64,
    pub airline_iata: String,
    pub from_airport: String,
    pub to_airport: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_sky_condition_single_parent() {
        assert!(validate_sky_condition(Some(1), None, 1).is_ok());
        assert!(validate_sky_condition(None, Some(2), 4).is_ok());
        assert!(validate_sky_condition(Some(1), Some(2), 1).is_err());
        assert!(validate_sky_condition(None, None, 1).is_err());
        assert!(validate_sky_condition(Some(1), None, 0).is_err());
        assert!(validate_sky_condition(Some(1), None, 5).is_err());
    }

    #[test]
    fn test_merge_final_update_fills_fields() {
        let existing = FlightCompletion::default();
        let update = FinalFlightUpdate {
            flight_number: "AF001".to_string(),
            from_airport: "CDG".to_string(),
            to_airport: "JFK".to_string(),
            departure_scheduled_utc: ts("2025-01-01 10:00:00"),
            departure_final_utc: Some(ts("2025-01-01 10:12:00")),
            arrival_actual_utc: Some(ts("2025-01-01 13:05:00")),
            status_final: Some("Landed".to_string()),
            delay_min: Some(12),
        };

        let (merged, stale) = merge_final_update(&existing, &update);
        assert_eq!(stale, 0);
        assert_eq!(merged.delay_min, Some(12));
        assert_eq!(merged.status_final, Some("Landed".to_string()));
    }

    #[test]
    fn test_merge_final_update_suppresses_stale_blanking() {
        let existing = FlightCompletion {
            departure_final_utc: Some(ts("2025-01-01 10:12:00")),
            arrival_actual_utc: Some(ts("2025-01-01 13:05:00")),
            status_final: Some("Landed".to_string()),
            delay_min: Some(12),
        };
        let partial = FinalFlightUpdate {
            flight_number: "AF001".to_string(),
            from_airport: "CDG".to_string(),
            to_airport: "JFK".to_string(),
            departure_scheduled_utc: ts("2025-01-01 10:00:00"),
            departure_final_utc: None,
            arrival_actual_utc: None,
            status_final: None,
            delay_min: Some(15),
        };

        let (merged, stale) = merge_final_update(&existing, &partial);
        assert_eq!(stale, 3);
        assert_eq!(merged.status_final, Some("Landed".to_string()));
        assert_eq!(merged.arrival_actual_utc, existing.arrival_actual_utc);
        // A present value still overwrites
        assert_eq!(merged.delay_min, Some(15));
    }

    #[test]
    fn test_merge_final_update_idempotent() {
        let existing = FlightCompletion::default();
        let update = FinalFlightUpdate {
            flight_number: "AF001".to_string(),
            from_airport: "CDG".to_string(),
            to_airport: "JFK".to_string(),
            departure_scheduled_utc: ts("2025-01-01 10:00:00"),
            departure_final_utc: Some(ts("2025-01-01 10:12:00")),
            arrival_actual_utc: None,
            status_final: Some("Landed".to_string()),
            delay_min: Some(12),
        };

        let (once, _) = merge_final_update(&existing, &update);
        let (twice, _) = merge_final_update(&once, &update);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_flight_instants_prefer_actual() {
        let flight = NewFlight {
            flight_number: "AF001".to_string(),
            from_airport: "CDG".to_string(),
            to_airport: "JFK".to_string(),
            airline_code: Some("AF".to_string()),
            aircraft_code: None,
            operated_by: None,
            departure_scheduled_utc: ts("2025-01-01 10:00:00"),
            departure_actual_utc: Some(ts("2025-01-01 10:20:00")),
            departure_terminal: None,
            departure_gate: None,
            arrival_scheduled_utc: Some(ts("2025-01-01 13:00:00")),
            arrival_actual_utc: None,
            arrival_terminal: None,
            arrival_gate: None,
            status: Some("Scheduled".to_string()),
            delay_min: None,
            departure_metar_fk: None,
            arrival_taf_fk: None,
        };

        assert_eq!(flight.departure_instant(), ts("2025-01-01 10:20:00"));
        assert_eq!(flight.arrival_instant(), Some(ts("2025-01-01 13:00:00")));
    }
}
