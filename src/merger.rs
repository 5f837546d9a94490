use crate::config::EnrichmentPolicy;
use crate::db::models::{AirlineDim, AirportDim, CountryDim, RouteDim};
use std::collections::BTreeMap;
use tracing::debug;

/// A materialized dimension row that the snapshot merge can reconcile.
pub trait DimensionRow: Clone {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn active(&self) -> bool;
    fn set_active(&mut self, active: bool);
    /// Fold the snapshot row's enrichment fields into self.
    fn absorb(&mut self, snapshot: &Self, policy: EnrichmentPolicy);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStats {
    pub added: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub refreshed: usize,
    pub carried: usize,
}

/// Merge a fresh dimension snapshot against the previously materialized
/// rows, producing the next materialized state.
///
/// Rules, per natural key:
/// - present in both: enrichment absorbed; the active flag flips only when
///   the snapshot contradicts the previous state;
/// - absent from the snapshot: the previous row is carried forward
///   unchanged — absence is not deletion;
/// - new: the row gets the next free id; ids are never reassigned.
///
/// Pure snapshot-in/snapshot-out: persistence is the caller's concern.
pub fn merge_dimension<T: DimensionRow>(
    previous: &[T],
    snapshot: &[T],
    policy: EnrichmentPolicy,
) -> (Vec<T>, MergeStats) {
    let mut stats = MergeStats::default();

    let mut merged: BTreeMap<T::Key, T> = previous
        .iter()
        .map(|row| (row.key(), row.clone()))
        .collect();

    let mut next_id = previous.iter().map(|r| r.id()).max().unwrap_or(0) + 1;

    // Deterministic key order for id allocation
    let incoming: BTreeMap<T::Key, &T> =
        snapshot.iter().map(|row| (row.key(), row)).collect();

    for (key, snap) in &incoming {
        let snap = *snap;
        match merged.get_mut(key) {
            Some(existing) => {
                existing.absorb(snap, policy);
                if existing.active() != snap.active() {
                    if snap.active() {
                        stats.reactivated += 1;
                    } else {
                        stats.deactivated += 1;
                    }
                    existing.set_active(snap.active());
                } else {
                    stats.refreshed += 1;
                }
            }
            None => {
                let mut row = (*snap).clone();
                row.set_id(next_id);
                next_id += 1;
                stats.added += 1;
                merged.insert(key.clone(), row);
            }
        }
    }

    stats.carried = merged.len() - snapshot_key_count(snapshot);
    debug!(
        "Dimension merge: {} added, {} reactivated, {} deactivated, {} refreshed, {} carried",
        stats.added, stats.reactivated, stats.deactivated, stats.refreshed, stats.carried
    );

    (merged.into_values().collect(), stats)
}

fn snapshot_key_count<T: DimensionRow>(snapshot: &[T]) -> usize {
    let keys: std::collections::BTreeSet<T::Key> = snapshot.iter().map(|r| r.key()).collect();
    keys.len()
}

/// Source extracts report liveness as a letter; "Y" (yes) and "O" (oui) mean
/// active, anything else inactive.
pub fn normalize_active_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_uppercase()),
        Some(ref s) if s == "Y" || s == "O"
    )
}

fn merge_option<V: Clone>(
    current: &mut Option<V>,
    incoming: &Option<V>,
    policy: EnrichmentPolicy,
) {
    match policy {
        EnrichmentPolicy::Refresh => *current = incoming.clone(),
        EnrichmentPolicy::Retain => {
            if incoming.is_some() {
                *current = incoming.clone();
            }
        }
    }
}

impl DimensionRow for CountryDim {
    type Key = String;

    fn key(&self) -> String {
        self.code.clone()
    }
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
    fn absorb(&mut self, snapshot: &Self, policy: EnrichmentPolicy) {
        self.name = snapshot.name.clone();
        merge_option(&mut self.source_name, &snapshot.source_name, policy);
        merge_option(&mut self.match_score, &snapshot.match_score, policy);
    }
}

impl DimensionRow for AirlineDim {
    type Key = i64;

    fn key(&self) -> i64 {
        self.source_id
    }
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
    fn absorb(&mut self, snapshot: &Self, policy: EnrichmentPolicy) {
        self.name = snapshot.name.clone();
        merge_option(&mut self.iata, &snapshot.iata, policy);
        merge_option(&mut self.icao, &snapshot.icao, policy);
        merge_option(&mut self.country_code, &snapshot.country_code, policy);
        merge_option(&mut self.fleet_avg_age, &snapshot.fleet_avg_age, policy);
    }
}

impl DimensionRow for AirportDim {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.iata.clone(), self.icao.clone())
    }
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
    fn absorb(&mut self, snapshot: &Self, policy: EnrichmentPolicy) {
        self.name = snapshot.name.clone();
        merge_option(&mut self.country_code, &snapshot.country_code, policy);
    }
}

impl DimensionRow for RouteDim {
    type Key = (String, String, String);

    fn key(&self) -> (String, String, String) {
        (
            self.airline_iata.clone(),
            self.from_airport.clone(),
            self.to_airport.clone(),
        )
    }
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
    fn absorb(&mut self, _snapshot: &Self, _policy: EnrichmentPolicy) {
        // routes carry no enrichment beyond the key
    }
}
