use chrono::{DateTime, Duration, TimeZone, Utc};
use flight_warehouse::config::{EnrichmentPolicy, MatcherConfig};
use flight_warehouse::db::models::{
    merge_final_update, validate_sky_condition, AirlineDim, FinalFlightUpdate, FlightCompletion,
    MetarRef, TafSegmentRef,
};
use flight_warehouse::matcher::{select_arrival_taf, select_departure_metar};
use flight_warehouse::merger::{merge_dimension, DimensionRow};
use proptest::prelude::*;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn metar_strategy() -> impl Strategy<Value = MetarRef> {
    (0i64..10_000, 0i64..86_400).prop_map(|(id, offset)| MetarRef {
        id,
        external_id: format!("m-{}", id),
        station_id: "LFPG".to_string(),
        observation_time: base() + Duration::seconds(offset),
    })
}

fn taf_strategy() -> impl Strategy<Value = TafSegmentRef> {
    (
        0i64..10_000,
        0i64..86_400,
        proptest::option::of(1i64..43_200),
        proptest::option::of(prop_oneof![
            Just("FM".to_string()),
            Just("BECMG".to_string()),
            Just("TEMPO".to_string()),
            Just("PROB30".to_string()),
            Just("PROB40".to_string()),
        ]),
    )
        .prop_map(|(id, from_offset, span, indicator)| {
            let from = base() + Duration::seconds(from_offset);
            TafSegmentRef {
                id,
                external_id: format!("t-{}", id),
                station_id: "KJFK".to_string(),
                fcst_time_from: from,
                fcst_time_to: span.map(|s| from + Duration::seconds(s)),
                change_indicator: indicator,
                probability: None,
            }
        })
}

fn airline_strategy() -> impl Strategy<Value = AirlineDim> {
    (0i64..20, any::<bool>(), proptest::option::of(0.0f64..40.0)).prop_map(
        |(source_id, active, age)| AirlineDim {
            id: 0,
            source_id,
            name: format!("Airline {}", source_id),
            iata: None,
            icao: None,
            country_code: None,
            fleet_avg_age: age,
            active,
        },
    )
}

fn completion_strategy() -> impl Strategy<Value = FlightCompletion> {
    (
        proptest::option::of(0i64..10_000),
        proptest::option::of(0i64..10_000),
        proptest::option::of(prop_oneof![Just("Landed".to_string()), Just("Cancelled".to_string())]),
        proptest::option::of(-60i32..600),
    )
        .prop_map(|(dep, arr, status, delay)| FlightCompletion {
            departure_final_utc: dep.map(|s| base() + Duration::seconds(s)),
            arrival_actual_utc: arr.map(|s| base() + Duration::seconds(s)),
            status_final: status,
            delay_min: delay,
        })
}

fn update_strategy() -> impl Strategy<Value = FinalFlightUpdate> {
    completion_strategy().prop_map(|c| FinalFlightUpdate {
        flight_number: "AF001".to_string(),
        from_airport: "CDG".to_string(),
        to_airport: "JFK".to_string(),
        departure_scheduled_utc: base(),
        departure_final_utc: c.departure_final_utc,
        arrival_actual_utc: c.arrival_actual_utc,
        status_final: c.status_final,
        delay_min: c.delay_min,
    })
}

proptest! {
    /// A sky layer validates exactly when it has one parent and an order in 1..=4
    #[test]
    fn sky_condition_single_parent_invariant(
        metar_fk in proptest::option::of(1i64..100),
        taf_fk in proptest::option::of(1i64..100),
        order in -2i32..8,
    ) {
        let valid = validate_sky_condition(metar_fk, taf_fk, order).is_ok();
        let expected = (metar_fk.is_some() ^ taf_fk.is_some()) && (1..=4).contains(&order);
        prop_assert_eq!(valid, expected);
    }

    /// Candidate ordering never changes which METAR is selected
    #[test]
    fn metar_selection_order_independent(
        mut candidates in proptest::collection::vec(metar_strategy(), 0..20),
        departure_offset in 0i64..86_400,
    ) {
        let config = MatcherConfig { metar_window_hours: 3 };
        let departure = base() + Duration::seconds(departure_offset);

        let forward = select_departure_metar(&candidates, "LFPG", departure, &config)
            .map(|m| m.id);
        candidates.reverse();
        let backward = select_departure_metar(&candidates, "LFPG", departure, &config)
            .map(|m| m.id);

        prop_assert_eq!(forward, backward);
    }

    /// The selected METAR is always inside the window and no candidate is closer
    #[test]
    fn metar_selection_is_nearest_in_window(
        candidates in proptest::collection::vec(metar_strategy(), 0..20),
        departure_offset in 0i64..86_400,
    ) {
        let config = MatcherConfig { metar_window_hours: 3 };
        let departure = base() + Duration::seconds(departure_offset);
        let window = Duration::hours(3);

        if let Some(best) = select_departure_metar(&candidates, "LFPG", departure, &config) {
            let best_distance = (best.observation_time - departure).abs();
            prop_assert!(best_distance <= window);
            for m in &candidates {
                prop_assert!((m.observation_time - departure).abs() >= best_distance);
            }
        } else {
            for m in &candidates {
                prop_assert!((m.observation_time - departure).abs() > window);
            }
        }
    }

    /// The selected TAF segment always covers the arrival instant
    #[test]
    fn taf_selection_covers_arrival(
        mut candidates in proptest::collection::vec(taf_strategy(), 0..20),
        arrival_offset in 0i64..86_400,
    ) {
        let arrival = base() + Duration::seconds(arrival_offset);

        // distinct ids so a selected id names one row
        for (i, t) in candidates.iter_mut().enumerate() {
            t.id = i as i64;
            t.external_id = format!("t-{}", i);
        }

        let forward = select_arrival_taf(&candidates, "KJFK", arrival).map(|t| t.id);
        if let Some(id) = forward {
            let best = candidates.iter().find(|t| t.id == id).unwrap();
            prop_assert!(best.fcst_time_from <= arrival);
            if let Some(to) = best.fcst_time_to {
                prop_assert!(arrival < to);
            }
        }

        candidates.reverse();
        let backward = select_arrival_taf(&candidates, "KJFK", arrival).map(|t| t.id);
        prop_assert_eq!(forward, backward);
    }

    /// Entities absent from the snapshot keep their previous state verbatim
    #[test]
    fn merge_preserves_absent_entities(
        previous in proptest::collection::vec(airline_strategy(), 0..10),
    ) {
        // Deduplicate keys and assign distinct ids as a real previous state has
        let mut seen = std::collections::BTreeMap::new();
        for (i, mut row) in previous.into_iter().enumerate() {
            row.id = i as i64 + 1;
            seen.entry(row.source_id).or_insert(row);
        }
        let previous: Vec<AirlineDim> = seen.into_values().collect();

        let (merged, stats) = merge_dimension(&previous, &[], EnrichmentPolicy::Retain);

        prop_assert_eq!(merged.len(), previous.len());
        prop_assert_eq!(stats.carried, previous.len());
        for row in &previous {
            let kept = merged.iter().find(|m| m.source_id == row.source_id).unwrap();
            prop_assert_eq!(kept, row);
        }
    }

    /// Ids present before a merge survive it; new ids never collide
    #[test]
    fn merge_ids_are_stable_and_unique(
        previous in proptest::collection::vec(airline_strategy(), 0..10),
        snapshot in proptest::collection::vec(airline_strategy(), 0..10),
    ) {
        let mut seen = std::collections::BTreeMap::new();
        for (i, mut row) in previous.into_iter().enumerate() {
            row.id = i as i64 + 1;
            seen.entry(row.source_id).or_insert(row);
        }
        let previous: Vec<AirlineDim> = seen.into_values().collect();

        let (merged, _) = merge_dimension(&previous, &snapshot, EnrichmentPolicy::Retain);

        let mut ids: Vec<i64> = merged.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), merged.len());

        for row in &previous {
            let kept = merged.iter().find(|m| m.key() == row.key()).unwrap();
            prop_assert_eq!(kept.id, row.id);
        }
    }

    /// Applying the same final update twice equals applying it once, and no
    /// set field ever reverts to null
    #[test]
    fn final_update_monotonic_and_idempotent(
        existing in completion_strategy(),
        update in update_strategy(),
    ) {
        let (once, _) = merge_final_update(&existing, &update);
        let (twice, stale) = merge_final_update(&once, &update);
        prop_assert_eq!(&once, &twice);

        prop_assert!(existing.departure_final_utc.is_none() || once.departure_final_utc.is_some());
        prop_assert!(existing.arrival_actual_utc.is_none() || once.arrival_actual_utc.is_some());
        prop_assert!(existing.status_final.is_none() || once.status_final.is_some());
        prop_assert!(existing.delay_min.is_none() || once.delay_min.is_some());

        // stale count on the second pass only reflects fields the update lacks
        let missing = [
            update.departure_final_utc.is_none() && once.departure_final_utc.is_some(),
            update.arrival_actual_utc.is_none() && once.arrival_actual_utc.is_some(),
            update.status_final.is_none() && once.status_final.is_some(),
            update.delay_min.is_none() && once.delay_min.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        prop_assert_eq!(stale, missing);
    }
}
