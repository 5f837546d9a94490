use crate::config::MatcherConfig;
use crate::db::models::{MetarRef, NewFlight, TafSegmentRef};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Resolved weather keys for one flight. A None is a valid outcome, not an
/// error: the flight was collected outside the weather refresh cadence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherKeys {
    pub metar_fk: Option<i64>,
    pub taf_fk: Option<i64>,
}

/// Ranking of TAF change indicators. Lower wins. FM replaces the base
/// forecast outright, BECMG is a gradual change, TEMPO a fluctuation, PROB
/// probabilistic; the base segment carries no indicator and ranks last.
fn change_priority(indicator: Option<&str>) -> u8 {
    match indicator.map(|s| s.trim().to_uppercase()) {
        Some(ref s) if s == "FM" => 1,
        Some(ref s) if s == "BECMG" => 2,
        Some(ref s) if s == "TEMPO" => 3,
        Some(ref s) if s.starts_with("PROB") => 4,
        Some(ref s) if !s.is_empty() => 5,
        _ => 5,
    }
}

/// Pick the METAR observation closest to the departure instant among those
/// for the departure station within the configured window.
///
/// Ties on distance go to the later observation (most recently issued); any
/// remaining tie is broken on external_id so re-runs are deterministic.
pub fn select_departure_metar<'a>(
    candidates: &'a [MetarRef],
    station_icao: &str,
    departure: DateTime<Utc>,
    config: &MatcherConfig,
) -> Option<&'a MetarRef> {
    let window = Duration::hours(config.metar_window_hours);

    candidates
        .iter()
        .filter(|m| m.station_id == station_icao)
        .filter(|m| {
            let distance = m.observation_time - departure;
            distance.abs() <= window
        })
        .min_by(|a, b| {
            let da = (a.observation_time - departure).abs();
            let db = (b.observation_time - departure).abs();
            da.cmp(&db)
                // equidistant: later observation first
                .then_with(|| b.observation_time.cmp(&a.observation_time))
                .then_with(|| a.external_id.cmp(&b.external_id))
        })
}

/// Pick the authoritative TAF forecast segment covering the arrival instant
/// for the arrival station.
///
/// A segment covers the instant when arrival lies in [fcst_time_from,
/// fcst_time_to); a segment without fcst_time_to is open-ended. Covering
/// segments are ranked by change-indicator priority, then by shorter window,
/// then by distance to the window centre, then external_id. The base
/// forecast is not discarded by losing here: it stays reachable through the
/// bulletin external_id and its sky_condition rows.
pub fn select_arrival_taf<'a>(
    candidates: &'a [TafSegmentRef],
    station_icao: &str,
    arrival: DateTime<Utc>,
) -> Option<&'a TafSegmentRef> {
    candidates
        .iter()
        .filter(|t| t.station_id == station_icao)
        .filter_map(|t| rank_segment(t, arrival).map(|rank| (rank, t)))
        .min_by(|(ra, a), (rb, b)| ra.cmp(rb).then_with(|| a.external_id.cmp(&b.external_id)))
        .map(|(_, t)| t)
}

/// Ranking key for a covering segment, or None when the segment does not
/// cover the arrival instant.
fn rank_segment(segment: &TafSegmentRef, arrival: DateTime<Utc>) -> Option<(u8, i64, i64)> {
    let from = segment.fcst_time_from;

    let (covers, window_secs, centre_distance_secs) = match segment.fcst_time_to {
        Some(to) => {
            // half-open [from, to)
            if from <= arrival && arrival < to {
                let window = (to - from).num_seconds();
                let centre = from + (to - from) / 2;
                (true, window, (arrival - centre).num_seconds().abs())
            } else {
                (false, 0, 0)
            }
        }
        None => {
            // open-ended [from, ..): penalised by measuring from the start
            if arrival >= from {
                (true, i64::MAX, (arrival - from).num_seconds().abs())
            } else {
                (false, 0, 0)
            }
        }
    };

    if !covers {
        return None;
    }

    Some((
        change_priority(segment.change_indicator.as_deref()),
        window_secs,
        centre_distance_secs,
    ))
}

/// Resolve both weather keys for one flight. Stations are ICAO codes already
/// resolved from the flight's IATA endpoints; a missing mapping yields None
/// for that leg.
pub fn match_weather(
    flight: &NewFlight,
    departure_icao: Option<&str>,
    arrival_icao: Option<&str>,
    metars: &[MetarRef],
    tafs: &[TafSegmentRef],
    config: &MatcherConfig,
) -> WeatherKeys {
    let metar_fk = departure_icao.and_then(|icao| {
        select_departure_metar(metars, icao, flight.departure_instant(), config).map(|m| m.id)
    });

    let taf_fk = arrival_icao.and_then(|icao| {
        flight
            .arrival_instant()
            .and_then(|arrival| select_arrival_taf(tafs, icao, arrival).map(|t| t.id))
    });

    if metar_fk.is_none() {
        debug!(
            "No METAR match for {} {}->{} at {}",
            flight.flight_number,
            flight.from_airport,
            flight.to_airport,
            flight.departure_instant()
        );
    }
    if taf_fk.is_none() {
        debug!(
            "No TAF match for {} {}->{}",
            flight.flight_number, flight.from_airport, flight.to_airport
        );
    }

    WeatherKeys { metar_fk, taf_fk }
}
