use crate::config::Config;
use crate::db::models::{
    AirlineDim, AirportDim, CountryDim, InsertOutcome, NewProcessedBatch, RouteDim,
};
use crate::db::Repository;
use crate::error::Result;
use crate::extracts::{self, DimensionExtracts};
use crate::matcher;
use crate::merger::{merge_dimension, normalize_active_flag, MergeStats};
use crate::resolver::{self, JaroWinkler, ResolutionStats, ResolvedCountry};
use crate::staging;
use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    config: Config,
    repository: Arc<Repository>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct RunSummary {
    countries_matched: usize,
    countries_unmatched: usize,
    country_names_unmatched: usize,
    metars_inserted: usize,
    metar_duplicates: usize,
    tafs_inserted: usize,
    taf_duplicates: usize,
    sky_rejected: usize,
    flights_inserted: usize,
    flights_already_present: usize,
    flights_filtered: usize,
    finals_applied: usize,
    finals_inserted: usize,
    stale_fields_suppressed: usize,
    batches_processed: usize,
    batches_skipped: usize,
}

impl RunSummary {
    fn record_resolution(&mut self, stats: &ResolutionStats) {
        self.countries_matched = stats.matched;
        self.countries_unmatched = stats.unmatched_canonical;
        self.country_names_unmatched = stats.unmatched_candidates;
    }
}

impl Scheduler {
    pub fn new(
        config: Config,
        repository: Arc<Repository>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            repository,
            shutdown_rx,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);
        let poll_interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.scheduler.initial_delay_seconds, self.config.scheduler.interval_minutes
        );

        // Initial delay
        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        // Run immediately, then on interval
        if let Err(e) = self.run_pipeline().await {
            error!("Pipeline error: {}", e);
        }

        let mut ticker = interval(poll_interval);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pipeline().await {
                        error!("Pipeline error: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One warehouse run. Dimensions always land before any fact that could
    /// reference them; staged batches already in the ledger are skipped.
    async fn run_pipeline(&self) -> Result<()> {
        info!("Starting warehouse run");
        let mut summary = RunSummary::default();

        let extracts = extracts::load_extracts(&self.config.extracts.dir)?;
        let (resolved, resolution) = resolve_countries(&extracts);
        summary.record_resolution(&resolution);
        self.merge_dimensions(&extracts, &resolved).await?;

        self.process_weather_batches(&mut summary).await?;
        self.process_schedule_batches(&extracts, &mut summary).await?;
        self.process_final_batches(&mut summary).await?;

        info!(
            "Warehouse run complete: countries {} matched / {} unmatched \
             ({} source names unmatched), \
             {} METARs (+{} dup), {} TAFs (+{} dup), \
             {} sky layers rejected, \
             {} flights inserted ({} already present, {} filtered), \
             {} final updates ({} created rows, {} stale fields suppressed), \
             {} batches processed, {} skipped",
            summary.countries_matched,
            summary.countries_unmatched,
            summary.country_names_unmatched,
            summary.metars_inserted,
            summary.metar_duplicates,
            summary.tafs_inserted,
            summary.taf_duplicates,
            summary.sky_rejected,
            summary.flights_inserted,
            summary.flights_already_present,
            summary.flights_filtered,
            summary.finals_applied,
            summary.finals_inserted,
            summary.stale_fields_suppressed,
            summary.batches_processed,
            summary.batches_skipped,
        );

        Ok(())
    }

    async fn merge_dimensions(
        &self,
        extracts: &DimensionExtracts,
        resolved: &[ResolvedCountry],
    ) -> Result<()> {
        let policy = self.config.merger.enrichment;
        let country_codes = resolver::code_lookup(resolved);

        let country_snapshot: Vec<CountryDim> = resolved
            .iter()
            .map(|r| CountryDim {
                id: 0,
                code: r.code.clone(),
                name: r.name.clone(),
                source_name: r.matched.as_ref().map(|m| m.source_name.clone()),
                match_score: r.matched.as_ref().map(|m| m.score),
                active: true,
            })
            .collect();

        let previous = self.repository.fetch_country_dims().await?;
        let (merged, stats) = merge_dimension(&previous, &country_snapshot, policy);
        self.repository.save_country_dims(&merged).await?;
        log_merge("country", &stats);

        let airline_snapshot: Vec<AirlineDim> = extracts
            .airlines
            .iter()
            .map(|a| AirlineDim {
                id: 0,
                source_id: a.id,
                name: a.name.clone(),
                iata: a.iata.clone(),
                icao: a.icao.clone(),
                country_code: a
                    .country
                    .as_ref()
                    .and_then(|c| country_codes.get(c).cloned()),
                fleet_avg_age: extracts.fleet_ages.get(&a.name).copied(),
                active: normalize_active_flag(a.active.as_deref()),
            })
            .collect();

        let previous = self.repository.fetch_airline_dims().await?;
        let (merged, stats) = merge_dimension(&previous, &airline_snapshot, policy);
        self.repository.save_airline_dims(&merged).await?;
        log_merge("airline", &stats);

        // Airports and routes rarely carry a liveness flag; absence means
        // the row is live in the source.
        let airport_snapshot: Vec<AirportDim> = extracts
            .airports
            .iter()
            .filter(|a| !a.iata.is_empty() && !a.icao.is_empty())
            .map(|a| AirportDim {
                id: 0,
                iata: a.iata.to_uppercase(),
                icao: a.icao.to_uppercase(),
                name: a.name.clone(),
                country_code: a
                    .country
                    .as_ref()
                    .and_then(|c| country_codes.get(c).cloned()),
                active: a
                    .active
                    .as_deref()
                    .map(|f| normalize_active_flag(Some(f)))
                    .unwrap_or(true),
            })
            .collect();

        let previous = self.repository.fetch_airport_dims().await?;
        let (merged, stats) = merge_dimension(&previous, &airport_snapshot, policy);
        self.repository.save_airport_dims(&merged).await?;
        log_merge("airport", &stats);

        let route_snapshot: Vec<RouteDim> = extracts
            .routes
            .iter()
            .map(|r| RouteDim {
                id: 0,
                airline_iata: r.airline.to_uppercase(),
                from_airport: r.from.to_uppercase(),
                to_airport: r.to.to_uppercase(),
                active: r
                    .active
                    .as_deref()
                    .map(|f| normalize_active_flag(Some(f)))
                    .unwrap_or(true),
            })
            .collect();

        let previous = self.repository.fetch_route_dims().await?;
        let (merged, stats) = merge_dimension(&previous, &route_snapshot, policy);
        self.repository.save_route_dims(&merged).await?;
        log_merge("route", &stats);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Staged batches
    // -----------------------------------------------------------------------

    fn list_batches(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let full = format!("{}/{}", self.config.staging.dir, pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full)
            .map_err(|e| crate::error::AppError::Config(format!("Bad staging glob: {}", e)))?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn batch_name(path: &PathBuf) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    async fn process_weather_batches(&self, summary: &mut RunSummary) -> Result<()> {
        let threshold = self.config.staging.parse_failure_threshold;

        for path in self.list_batches("metar-*.json")? {
            let name = Self::batch_name(&path);
            if self.repository.is_batch_processed(&name).await? {
                summary.batches_skipped += 1;
                continue;
            }

            info!("Processing METAR batch {}", name);
            let docs = match staging::read_batch_file(&path) {
                Ok(docs) => docs,
                Err(e) => {
                    error!("METAR batch {} unreadable: {}", name, e);
                    self.mark_failed_batch(&name, "metar", 0).await?;
                    continue;
                }
            };
            match staging::parse_metar_docs(&docs, threshold) {
                Ok((metars, stats)) => {
                    let result = self.repository.insert_metars(&metars).await?;
                    summary.metars_inserted += result.inserted;
                    summary.metar_duplicates += result.duplicates;
                    summary.sky_rejected += result.sky_rejected;
                    if result.sky_rejected > 0 {
                        warn!("{}: {} sky layers rejected", name, result.sky_rejected);
                    }
                    self.mark_batch(&name, "metar", &stats, result.inserted, "completed")
                        .await?;
                    summary.batches_processed += 1;
                }
                Err(e) => {
                    error!("METAR batch {} rejected: {}", name, e);
                    self.mark_failed_batch(&name, "metar", docs.len()).await?;
                }
            }
        }

        for path in self.list_batches("taf-*.json")? {
            let name = Self::batch_name(&path);
            if self.repository.is_batch_processed(&name).await? {
                summary.batches_skipped += 1;
                continue;
            }

            info!("Processing TAF batch {}", name);
            let docs = match staging::read_batch_file(&path) {
                Ok(docs) => docs,
                Err(e) => {
                    error!("TAF batch {} unreadable: {}", name, e);
                    self.mark_failed_batch(&name, "taf", 0).await?;
                    continue;
                }
            };
            match staging::parse_taf_docs(&docs, threshold) {
                Ok((tafs, stats)) => {
                    let result = self.repository.insert_tafs(&tafs).await?;
                    summary.tafs_inserted += result.inserted;
                    summary.taf_duplicates += result.duplicates;
                    summary.sky_rejected += result.sky_rejected;
                    if result.sky_rejected > 0 {
                        warn!("{}: {} sky layers rejected", name, result.sky_rejected);
                    }
                    self.mark_batch(&name, "taf", &stats, result.inserted, "completed")
                        .await?;
                    summary.batches_processed += 1;
                }
                Err(e) => {
                    error!("TAF batch {} rejected: {}", name, e);
                    self.mark_failed_batch(&name, "taf", docs.len()).await?;
                }
            }
        }

        Ok(())
    }

    async fn process_schedule_batches(
        &self,
        extracts: &DimensionExtracts,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let threshold = self.config.staging.parse_failure_threshold;

        // "flights-*.json" also matches the final-pass files; keep the two
        // passes disjoint.
        let finals: std::collections::BTreeSet<PathBuf> =
            self.list_batches("flights-final-*.json")?.into_iter().collect();

        for path in self.list_batches("flights-*.json")? {
            if finals.contains(&path) {
                continue;
            }
            let name = Self::batch_name(&path);
            if self.repository.is_batch_processed(&name).await? {
                summary.batches_skipped += 1;
                continue;
            }

            info!("Processing flight schedule batch {}", name);
            let docs = match staging::read_batch_file(&path) {
                Ok(docs) => docs,
                Err(e) => {
                    error!("Flight batch {} unreadable: {}", name, e);
                    self.mark_failed_batch(&name, "flight", 0).await?;
                    continue;
                }
            };
            match staging::parse_flight_docs(&docs, threshold) {
                Ok((flights, stats)) => {
                    let loaded = self.load_schedule_flights(extracts, flights, summary).await?;
                    self.mark_batch(&name, "flight", &stats, loaded, "completed")
                        .await?;
                    summary.batches_processed += 1;
                }
                Err(e) => {
                    error!("Flight batch {} rejected: {}", name, e);
                    self.mark_failed_batch(&name, "flight", docs.len()).await?;
                }
            }
        }

        Ok(())
    }

    /// Filter, weather-match and insert one schedule batch. Returns the
    /// number of rows inserted.
    async fn load_schedule_flights(
        &self,
        extracts: &DimensionExtracts,
        flights: Vec<crate::db::models::NewFlight>,
        summary: &mut RunSummary,
    ) -> Result<usize> {
        let mut kept = Vec::new();
        for flight in flights {
            // Codeshare legs are published again under the operating
            // carrier's own number; loading both would double-count.
            if flight.operated_by.as_deref().is_some_and(|o| !o.is_empty()) {
                debug!(
                    "Skipping codeshare {} operated by {}",
                    flight.flight_number,
                    flight.operated_by.as_deref().unwrap_or("")
                );
                summary.flights_filtered += 1;
                continue;
            }
            if !self
                .config
                .airports
                .matches_flight(&flight.from_airport, &flight.to_airport)
            {
                summary.flights_filtered += 1;
                continue;
            }
            kept.push(flight);
        }

        if kept.is_empty() {
            return Ok(0);
        }

        // Resolve stations once per batch and fetch candidates covering the
        // whole batch's departure span.
        let stations: Vec<String> = {
            let mut s: Vec<String> = kept
                .iter()
                .flat_map(|f| [f.from_airport.to_uppercase(), f.to_airport.to_uppercase()])
                .filter_map(|iata| extracts.stations.get(&iata).cloned())
                .collect();
            s.sort();
            s.dedup();
            s
        };

        let window = ChronoDuration::hours(self.config.matcher.metar_window_hours);
        let departures: Vec<_> = kept.iter().map(|f| f.departure_instant()).collect();
        let earliest = departures.iter().min().copied();
        let latest = departures.iter().max().copied();

        let metars = match (earliest, latest) {
            (Some(lo), Some(hi)) if !stations.is_empty() => {
                self.repository
                    .fetch_metar_candidates(&stations, lo - window, hi + window)
                    .await?
            }
            _ => Vec::new(),
        };
        let tafs = if stations.is_empty() {
            Vec::new()
        } else {
            self.repository.fetch_taf_candidates(&stations).await?
        };

        let station_of = |iata: &str| -> Option<&str> {
            extracts.stations.get(&iata.to_uppercase()).map(String::as_str)
        };

        let mut to_insert = Vec::new();
        for mut flight in kept {
            let keys = matcher::match_weather(
                &flight,
                station_of(&flight.from_airport),
                station_of(&flight.to_airport),
                &metars,
                &tafs,
                &self.config.matcher,
            );

            if self.config.loader.require_weather
                && (keys.metar_fk.is_none() || keys.taf_fk.is_none())
            {
                debug!(
                    "Skipping {} {}->{}: incomplete weather context",
                    flight.flight_number, flight.from_airport, flight.to_airport
                );
                summary.flights_filtered += 1;
                continue;
            }

            flight.departure_metar_fk = keys.metar_fk;
            flight.arrival_taf_fk = keys.taf_fk;
            to_insert.push(flight);
        }

        let outcomes = self.repository.insert_flights(&to_insert).await?;
        let mut inserted = 0usize;
        for outcome in outcomes {
            match outcome {
                InsertOutcome::Inserted(_) => {
                    inserted += 1;
                    summary.flights_inserted += 1;
                }
                InsertOutcome::AlreadyPresent(_) => summary.flights_already_present += 1,
            }
        }

        Ok(inserted)
    }

    async fn process_final_batches(&self, summary: &mut RunSummary) -> Result<()> {
        let threshold = self.config.staging.parse_failure_threshold;

        for path in self.list_batches("flights-final-*.json")? {
            let name = Self::batch_name(&path);
            if self.repository.is_batch_processed(&name).await? {
                summary.batches_skipped += 1;
                continue;
            }

            info!("Processing final flight batch {}", name);
            let docs = match staging::read_batch_file(&path) {
                Ok(docs) => docs,
                Err(e) => {
                    error!("Final flight batch {} unreadable: {}", name, e);
                    self.mark_failed_batch(&name, "flight-final", 0).await?;
                    continue;
                }
            };
            match staging::parse_final_docs(&docs, threshold) {
                Ok((updates, stats)) => {
                    let mut applied = 0usize;
                    for update in &updates {
                        let outcome = self.repository.apply_final_update(update).await?;
                        applied += 1;
                        summary.finals_applied += 1;
                        summary.stale_fields_suppressed += outcome.stale_suppressed;
                        if outcome.inserted {
                            summary.finals_inserted += 1;
                        }
                    }
                    self.mark_batch(&name, "flight-final", &stats, applied, "completed")
                        .await?;
                    summary.batches_processed += 1;
                }
                Err(e) => {
                    error!("Final flight batch {} rejected: {}", name, e);
                    self.mark_failed_batch(&name, "flight-final", docs.len()).await?;
                }
            }
        }

        Ok(())
    }

    async fn mark_batch(
        &self,
        name: &str,
        kind: &str,
        stats: &staging::ParseStats,
        loaded: usize,
        status: &str,
    ) -> Result<()> {
        self.repository
            .mark_batch_processed(NewProcessedBatch {
                batch_name: name.to_string(),
                kind: kind.to_string(),
                records_read: stats.total_records as i32,
                records_loaded: loaded as i32,
                parse_failures: stats.parse_failures as i32,
                processing_status: status.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn mark_failed_batch(&self, name: &str, kind: &str, records_read: usize) -> Result<()> {
        self.repository
            .mark_batch_processed(NewProcessedBatch {
                batch_name: name.to_string(),
                kind: kind.to_string(),
                records_read: records_read as i32,
                records_loaded: 0,
                parse_failures: records_read as i32,
                processing_status: "failed".to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Resolve every country name mentioned by the airline and airport extracts
/// against the canonical catalog. Returns the resolution alongside its stats
/// so the run summary can report the unmatched counts.
fn resolve_countries(extracts: &DimensionExtracts) -> (Vec<ResolvedCountry>, ResolutionStats) {
    let mut candidates: Vec<String> = extracts
        .airlines
        .iter()
        .filter_map(|a| a.country.clone())
        .chain(extracts.airports.iter().filter_map(|a| a.country.clone()))
        .collect();
    candidates.sort();
    candidates.dedup();

    let (resolved, stats) = resolver::match_countries(
        &candidates,
        &extracts.countries,
        &JaroWinkler,
        resolver::DEFAULT_SIMILARITY_THRESHOLD,
    );

    info!(
        "Country resolution: {} matched, {} canonical unmatched, {} source names unmatched",
        stats.matched, stats.unmatched_canonical, stats.unmatched_candidates
    );

    (resolved, stats)
}

fn log_merge(dimension: &str, stats: &MergeStats) {
    info!(
        "Merged {} dimension: {} added, {} reactivated, {} deactivated, {} refreshed, {} carried",
        dimension, stats.added, stats.reactivated, stats.deactivated, stats.refreshed, stats.carried
    );
}
