use crate::db::models::{
    validate_sky_condition, AirlineDim, AirportDim, CountryDim, FinalFlightUpdate,
    FinalUpdateOutcome, FlightCompletion, FlightPrediction, InsertOutcome, MetarRef, NewFlight,
    NewMetar, NewProcessedBatch, NewSkyLayer, NewTaf, RouteDim, TafSegmentRef, WeatherLoadResult,
};
use crate::db::models::merge_final_update;
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batch ledger
    // -----------------------------------------------------------------------

    pub async fn is_batch_processed(&self, batch_name: &str) -> Result<bool> {
        let result = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM processed_batches WHERE batch_name = $1 AND processing_status = 'completed'",
        )
        .bind(batch_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(result > 0)
    }

    pub async fn mark_batch_processed(&self, batch: NewProcessedBatch) -> Result<i32> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO processed_batches
                (batch_name, kind, records_read, records_loaded, parse_failures, processing_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_name) DO UPDATE SET
                records_read = EXCLUDED.records_read,
                records_loaded = EXCLUDED.records_loaded,
                parse_failures = EXCLUDED.parse_failures,
                processing_status = EXCLUDED.processing_status,
                processed_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&batch.batch_name)
        .bind(&batch.kind)
        .bind(batch.records_read)
        .bind(batch.records_loaded)
        .bind(batch.parse_failures)
        .bind(&batch.processing_status)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Weather facts
    // -----------------------------------------------------------------------

    /// Insert METAR records, skipping any whose external_id is already
    /// present. Sky layers are attached to freshly inserted parents only;
    /// layers failing the single-parent/order check are counted and dropped.
    pub async fn insert_metars(&self, metars: &[NewMetar]) -> Result<WeatherLoadResult> {
        let mut result = WeatherLoadResult::default();
        if metars.is_empty() {
            return Ok(result);
        }

        let mut tx = self.pool.begin().await?;

        for metar in metars {
            let inserted_id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO metar
                    (external_id, station_id, observation_time, raw_text,
                     temp_c, dewpoint_c, wind_dir_degrees, wind_speed_kt, wind_gust_kt,
                     visibility_statute_mi, altim_in_hg, sea_level_pressure_mb,
                     flight_category, metar_type, precip_in, vert_vis_ft, wx_string)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (external_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&metar.external_id)
            .bind(&metar.station_id)
            .bind(metar.observation_time)
            .bind(&metar.raw_text)
            .bind(metar.temp_c)
            .bind(metar.dewpoint_c)
            .bind(metar.wind_dir_degrees)
            .bind(metar.wind_speed_kt)
            .bind(metar.wind_gust_kt)
            .bind(metar.visibility_statute_mi)
            .bind(metar.altim_in_hg)
            .bind(metar.sea_level_pressure_mb)
            .bind(&metar.flight_category)
            .bind(&metar.metar_type)
            .bind(metar.precip_in)
            .bind(metar.vert_vis_ft)
            .bind(&metar.wx_string)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted_id {
                Some(id) => {
                    result.inserted += 1;
                    self.insert_sky_layers(&mut tx, Some(id), None, &metar.sky_conditions, &mut result)
                        .await?;
                }
                None => {
                    result.duplicates += 1;
                    debug!("METAR {} already present, skipped", metar.external_id);
                }
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Insert TAF segment records; same duplicate and sky-layer handling as
    /// METARs.
    pub async fn insert_tafs(&self, tafs: &[NewTaf]) -> Result<WeatherLoadResult> {
        let mut result = WeatherLoadResult::default();
        if tafs.is_empty() {
            return Ok(result);
        }

        let mut tx = self.pool.begin().await?;

        for taf in tafs {
            let inserted_id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO taf
                    (external_id, station_id, issue_time, bulletin_time,
                     valid_time_from, valid_time_to, fcst_time_from, fcst_time_to,
                     change_indicator, probability, wind_dir_degrees, wind_speed_kt,
                     wind_gust_kt, visibility_statute_mi, vert_vis_ft, wx_string, raw_text)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (external_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&taf.external_id)
            .bind(&taf.station_id)
            .bind(taf.issue_time)
            .bind(taf.bulletin_time)
            .bind(taf.valid_time_from)
            .bind(taf.valid_time_to)
            .bind(taf.fcst_time_from)
            .bind(taf.fcst_time_to)
            .bind(&taf.change_indicator)
            .bind(taf.probability)
            .bind(taf.wind_dir_degrees)
            .bind(taf.wind_speed_kt)
            .bind(taf.wind_gust_kt)
            .bind(taf.visibility_statute_mi)
            .bind(taf.vert_vis_ft)
            .bind(&taf.wx_string)
            .bind(&taf.raw_text)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted_id {
                Some(id) => {
                    result.inserted += 1;
                    self.insert_sky_layers(&mut tx, None, Some(id), &taf.sky_conditions, &mut result)
                        .await?;
                }
                None => {
                    result.duplicates += 1;
                    debug!("TAF {} already present, skipped", taf.external_id);
                }
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn insert_sky_layers(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metar_fk: Option<i64>,
        taf_fk: Option<i64>,
        layers: &[NewSkyLayer],
        result: &mut WeatherLoadResult,
    ) -> Result<()> {
        for layer in layers {
            if let Err(e) = validate_sky_condition(metar_fk, taf_fk, layer.condition_order) {
                warn!("Rejected sky layer: {}", e);
                result.sky_rejected += 1;
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO sky_condition
                    (metar_fk, taf_fk, sky_cover, cloud_base_ft_agl, cloud_type, condition_order)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(metar_fk)
            .bind(taf_fk)
            .bind(&layer.sky_cover)
            .bind(layer.cloud_base_ft_agl)
            .bind(layer.cloud_type.as_deref())
            .bind(layer.condition_order)
            .execute(&mut **tx)
            .await?;

            result.sky_inserted += 1;
        }

        Ok(())
    }

    /// METAR candidates for a set of stations inside a time range.
    pub async fn fetch_metar_candidates(
        &self,
        stations: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetarRef>> {
        let rows = sqlx::query_as::<_, MetarRef>(
            r#"
            SELECT id, external_id, station_id, observation_time
            FROM metar
            WHERE station_id = ANY($1)
              AND observation_time BETWEEN $2 AND $3
            ORDER BY observation_time
            "#,
        )
        .bind(stations)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// TAF segment candidates for a set of stations. Segments with no
    /// forecast start time can never contain an arrival and are excluded.
    pub async fn fetch_taf_candidates(
        &self,
        stations: &[String],
    ) -> Result<Vec<TafSegmentRef>> {
        let rows = sqlx::query_as::<_, TafSegmentRef>(
            r#"
            SELECT id, external_id, station_id, fcst_time_from, fcst_time_to,
                   change_indicator, probability
            FROM taf
            WHERE station_id = ANY($1)
              AND fcst_time_from IS NOT NULL
            ORDER BY fcst_time_from
            "#,
        )
        .bind(stations)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Flight facts
    // -----------------------------------------------------------------------

    async fn find_flight_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        flight_number: &str,
        from_airport: &str,
        to_airport: &str,
        departure_scheduled_utc: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM flight
            WHERE flight_number = $1
              AND from_airport = $2
              AND to_airport = $3
              AND departure_scheduled_utc = $4
            "#,
        )
        .bind(flight_number)
        .bind(from_airport)
        .bind(to_airport)
        .bind(departure_scheduled_utc)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Insert a flight fact unless its natural key (flight number, route,
    /// scheduled departure) already exists.
    pub async fn insert_flight(&self, flight: &NewFlight) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.insert_flight_in_tx(&mut tx, flight).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn insert_flight_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        flight: &NewFlight,
    ) -> Result<InsertOutcome> {
        if let Some(id) = self
            .find_flight_id(
                tx,
                &flight.flight_number,
                &flight.from_airport,
                &flight.to_airport,
                flight.departure_scheduled_utc,
            )
            .await?
        {
            debug!(
                "Flight {} {}->{} at {} already present",
                flight.flight_number,
                flight.from_airport,
                flight.to_airport,
                flight.departure_scheduled_utc
            );
            return Ok(InsertOutcome::AlreadyPresent(id));
        }

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO flight
                (flight_number, from_airport, to_airport, airline_code, aircraft_code,
                 operated_by, departure_scheduled_utc, departure_actual_utc,
                 departure_terminal, departure_gate, arrival_scheduled_utc,
                 arrival_actual_utc, arrival_terminal, arrival_gate, status, delay_min,
                 departure_metar_fk, arrival_taf_fk)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING id
            "#,
        )
        .bind(&flight.flight_number)
        .bind(&flight.from_airport)
        .bind(&flight.to_airport)
        .bind(&flight.airline_code)
        .bind(&flight.aircraft_code)
        .bind(&flight.operated_by)
        .bind(flight.departure_scheduled_utc)
        .bind(flight.departure_actual_utc)
        .bind(&flight.departure_terminal)
        .bind(&flight.departure_gate)
        .bind(flight.arrival_scheduled_utc)
        .bind(flight.arrival_actual_utc)
        .bind(&flight.arrival_terminal)
        .bind(&flight.arrival_gate)
        .bind(&flight.status)
        .bind(flight.delay_min)
        .bind(flight.departure_metar_fk)
        .bind(flight.arrival_taf_fk)
        .fetch_one(&mut **tx)
        .await?;

        Ok(InsertOutcome::Inserted(id))
    }

    /// Insert a batch of schedule-pass flights inside one transaction.
    pub async fn insert_flights(
        &self,
        flights: &[NewFlight],
    ) -> Result<Vec<InsertOutcome>> {
        let mut outcomes = Vec::with_capacity(flights.len());
        if flights.is_empty() {
            return Ok(outcomes);
        }

        let mut tx = self.pool.begin().await?;
        for flight in flights {
            outcomes.push(self.insert_flight_in_tx(&mut tx, flight).await?);
        }
        tx.commit().await?;

        Ok(outcomes)
    }

    /// Apply a final-pass update to an existing flight row, under monotonic
    /// completion. An unknown natural key gets a new skeleton row so that a
    /// late schedule pass can still find it.
    pub async fn apply_final_update(
        &self,
        update: &FinalFlightUpdate,
    ) -> Result<FinalUpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing_id = self
            .find_flight_id(
                &mut tx,
                &update.flight_number,
                &update.from_airport,
                &update.to_airport,
                update.departure_scheduled_utc,
            )
            .await?;

        let outcome = match existing_id {
            Some(id) => {
                let existing = sqlx::query_as::<_, FlightCompletion>(
                    r#"
                    SELECT departure_final_utc, arrival_actual_utc, status_final, delay_min
                    FROM flight WHERE id = $1
                    "#,
                )
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

                let (merged, stale_suppressed) = merge_final_update(&existing, update);

                sqlx::query(
                    r#"
                    UPDATE flight SET
                        departure_final_utc = $2,
                        arrival_actual_utc = $3,
                        status_final = $4,
                        delay_min = $5
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(merged.departure_final_utc)
                .bind(merged.arrival_actual_utc)
                .bind(&merged.status_final)
                .bind(merged.delay_min)
                .execute(&mut *tx)
                .await?;

                if stale_suppressed > 0 {
                    debug!(
                        "Suppressed {} stale field(s) for flight {} {}->{}",
                        stale_suppressed,
                        update.flight_number,
                        update.from_airport,
                        update.to_airport
                    );
                }

                FinalUpdateOutcome {
                    inserted: false,
                    stale_suppressed,
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO flight
                        (flight_number, from_airport, to_airport, departure_scheduled_utc,
                         departure_final_utc, arrival_actual_utc, status_final, delay_min)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(&update.flight_number)
                .bind(&update.from_airport)
                .bind(&update.to_airport)
                .bind(update.departure_scheduled_utc)
                .bind(update.departure_final_utc)
                .bind(update.arrival_actual_utc)
                .bind(&update.status_final)
                .bind(update.delay_min)
                .execute(&mut *tx)
                .await?;

                FinalUpdateOutcome {
                    inserted: true,
                    stale_suppressed: 0,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Write back delay predictions from the downstream scoring step.
    pub async fn update_flight_predictions(
        &self,
        predictions: &[FlightPrediction],
    ) -> Result<u64> {
        if predictions.is_empty() {
            return Ok(0);
        }

        let mut updated = 0u64;
        let mut tx = self.pool.begin().await?;

        for prediction in predictions {
            let result = sqlx::query(
                r#"
                UPDATE flight SET delay_prob = $2, delay_risk_level = $3
                WHERE id = $1
                "#,
            )
            .bind(prediction.flight_id)
            .bind(prediction.delay_prob)
            .bind(&prediction.delay_risk_level)
            .execute(&mut *tx)
            .await?;

            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Dimensions
    //
    // Each dimension is saved with a full-row upsert keyed on the stable id,
    // chunked to avoid query size limits, inside one transaction so a run
    // either lands a dimension completely or not at all.
    // -----------------------------------------------------------------------

    const DIM_BATCH_SIZE: usize = 1000;

    pub async fn fetch_country_dims(&self) -> Result<Vec<CountryDim>> {
        let rows = sqlx::query_as::<_, CountryDim>(
            "SELECT id, code, name, source_name, match_score, active FROM dim_country ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_country_dims(&self, rows: &[CountryDim]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(Self::DIM_BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO dim_country (id, code, name, source_name, match_score, active) ",
            );
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.code)
                    .push_bind(&row.name)
                    .push_bind(&row.source_name)
                    .push_bind(row.match_score)
                    .push_bind(row.active);
            });
            query_builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                code = EXCLUDED.code, \
                name = EXCLUDED.name, \
                source_name = EXCLUDED.source_name, \
                match_score = EXCLUDED.match_score, \
                active = EXCLUDED.active",
            );
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn fetch_airline_dims(&self) -> Result<Vec<AirlineDim>> {
        let rows = sqlx::query_as::<_, AirlineDim>(
            "SELECT id, source_id, name, iata, icao, country_code, fleet_avg_age, active \
             FROM dim_airline ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_airline_dims(&self, rows: &[AirlineDim]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(Self::DIM_BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO dim_airline (id, source_id, name, iata, icao, country_code, fleet_avg_age, active) ",
            );
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.source_id)
                    .push_bind(&row.name)
                    .push_bind(&row.iata)
                    .push_bind(&row.icao)
                    .push_bind(&row.country_code)
                    .push_bind(row.fleet_avg_age)
                    .push_bind(row.active);
            });
            query_builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                source_id = EXCLUDED.source_id, \
                name = EXCLUDED.name, \
                iata = EXCLUDED.iata, \
                icao = EXCLUDED.icao, \
                country_code = EXCLUDED.country_code, \
                fleet_avg_age = EXCLUDED.fleet_avg_age, \
                active = EXCLUDED.active",
            );
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn fetch_airport_dims(&self) -> Result<Vec<AirportDim>> {
        let rows = sqlx::query_as::<_, AirportDim>(
            "SELECT id, iata, icao, name, country_code, active FROM dim_airport ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_airport_dims(&self, rows: &[AirportDim]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(Self::DIM_BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO dim_airport (id, iata, icao, name, country_code, active) ",
            );
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.iata)
                    .push_bind(&row.icao)
                    .push_bind(&row.name)
                    .push_bind(&row.country_code)
                    .push_bind(row.active);
            });
            query_builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                iata = EXCLUDED.iata, \
                icao = EXCLUDED.icao, \
                name = EXCLUDED.name, \
                country_code = EXCLUDED.country_code, \
                active = EXCLUDED.active",
            );
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn fetch_route_dims(&self) -> Result<Vec<RouteDim>> {
        let rows = sqlx::query_as::<_, RouteDim>(
            "SELECT id, airline_iata, from_airport, to_airport, active FROM dim_route ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_route_dims(&self, rows: &[RouteDim]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(Self::DIM_BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO dim_route (id, airline_iata, from_airport, to_airport, active) ",
            );
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.airline_iata)
                    .push_bind(&row.from_airport)
                    .push_bind(&row.to_airport)
                    .push_bind(row.active);
            });
            query_builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                airline_iata = EXCLUDED.airline_iata, \
                from_airport = EXCLUDED.from_airport, \
                to_airport = EXCLUDED.to_airport, \
                active = EXCLUDED.active",
            );
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}
