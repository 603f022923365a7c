//! SQLite persistence shared by the ingestion pipeline, the aggregator,
//! and the serving layer.
//!
//! Observation upserts are `ON CONFLICT DO NOTHING`: the earlier record
//! wins, so re-running a task is byte-for-byte idempotent. Statistics rows
//! are replaced per (key, calculation_date) inside a transaction so the
//! prior row stays canonical until the new one commits. All timestamps are
//! stored as RFC 3339 UTC text.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::ingest::normalize::{DropCounts, NormalizedMetric, NormalizedStop};
use crate::providers::fares::FareRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

/// Pool sizing differs between the single-writer ingestion side and the
/// parallel serving side.
#[derive(Debug, Clone, Copy)]
pub enum PoolProfile {
    Writer,
    Reader,
}

impl PoolProfile {
    fn max_connections(self) -> u32 {
        match self {
            PoolProfile::Writer => 5,
            PoolProfile::Reader => 30,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_path: &str, profile: PoolProfile) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(profile.max_connections())
            .acquire_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(3600))
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let migrator = sqlx::migrate!("./migrations");
        migrator.run(&self.pool).await?;
        debug!(migrations = migrator.migrations.len(), "Migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // --- ingestion writes -------------------------------------------------

    /// Commit one task's batch atomically. Returns the number of rows that
    /// were actually new; conflicts mean an earlier run already owns them.
    pub async fn commit_batch(
        &self,
        metrics: &[NormalizedMetric],
        stops: &[NormalizedStop],
    ) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for metric in metrics {
            let result = sqlx::query(
                r#"
                INSERT INTO service_metrics
                    (origin, destination, scheduled_departure, scheduled_arrival,
                     toc_code, matched_services_count, fetch_timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (origin, destination, scheduled_departure,
                             scheduled_arrival, toc_code) DO NOTHING
                "#,
            )
            .bind(&metric.origin)
            .bind(&metric.destination)
            .bind(&metric.scheduled_departure)
            .bind(&metric.scheduled_arrival)
            .bind(&metric.toc_code)
            .bind(metric.matched_services_count)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        for stop in stops {
            let result = sqlx::query(
                r#"
                INSERT INTO service_details
                    (rid, date_of_service, toc_code, location, stop_sequence,
                     scheduled_departure, scheduled_arrival,
                     actual_departure, actual_arrival,
                     departure_delay_minutes, arrival_delay_minutes,
                     cancellation_reason, fetch_timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (rid, location) DO NOTHING
                "#,
            )
            .bind(&stop.rid)
            .bind(stop.date_of_service.to_string())
            .bind(&stop.toc_code)
            .bind(&stop.location)
            .bind(stop.stop_sequence)
            .bind(stop.scheduled_departure.map(|t| t.to_rfc3339()))
            .bind(stop.scheduled_arrival.map(|t| t.to_rfc3339()))
            .bind(stop.actual_departure.map(|t| t.to_rfc3339()))
            .bind(stop.actual_arrival.map(|t| t.to_rfc3339()))
            .bind(stop.departure_delay_minutes)
            .bind(stop.arrival_delay_minutes)
            .bind(&stop.cancellation_reason)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn record_drops(&self, phase: &str, drops: &DropCounts) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for (reason, count) in drops.iter() {
            sqlx::query(
                "INSERT INTO data_quality_metrics (phase, reason, dropped_count, recorded_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(phase)
            .bind(reason)
            .bind(count as i64)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // --- aggregator reads/writes -----------------------------------------

    pub async fn distinct_routes(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT origin, destination FROM service_metrics
             ORDER BY origin, destination",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("origin"), r.get("destination")))
            .collect())
    }

    pub async fn distinct_tocs(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT toc_code FROM service_details
             WHERE toc_code IS NOT NULL ORDER BY toc_code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("toc_code")).collect())
    }

    /// Destination-arrival observations for a route, ordered for stable
    /// percentile computation.
    pub async fn arrival_observations(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Vec<StopObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sd.rid, sd.date_of_service, sd.toc_code,
                   sd.scheduled_departure, sd.scheduled_arrival,
                   sd.arrival_delay_minutes, sd.cancellation_reason
            FROM service_details sd
            WHERE sd.location = ?
              AND sd.scheduled_arrival IS NOT NULL
              AND sd.toc_code IN (
                  SELECT DISTINCT toc_code FROM service_metrics
                  WHERE origin = ? AND destination = ?
              )
            ORDER BY sd.date_of_service, sd.scheduled_arrival, sd.rid
            "#,
        )
        .bind(destination)
        .bind(origin)
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StopObservation::from_row).collect()
    }

    pub async fn toc_observations(
        &self,
        toc_code: &str,
    ) -> Result<Vec<StopObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rid, date_of_service, toc_code,
                   scheduled_departure, scheduled_arrival,
                   arrival_delay_minutes, cancellation_reason
            FROM service_details
            WHERE toc_code = ? AND scheduled_arrival IS NOT NULL
            ORDER BY date_of_service, scheduled_arrival, rid
            "#,
        )
        .bind(toc_code)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StopObservation::from_row).collect()
    }

    pub async fn routes_served_by(&self, toc_code: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT origin || '-' || destination) AS n
             FROM service_metrics WHERE toc_code = ?",
        )
        .bind(toc_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    pub async fn replace_route_stat(&self, stat: &RouteStatRow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM route_statistics
             WHERE origin = ? AND destination = ? AND calculation_date = ?",
        )
        .bind(&stat.origin)
        .bind(&stat.destination)
        .bind(stat.calculation_date.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO route_statistics
                (origin, destination, calculation_date, data_start_date, data_end_date,
                 total_services, on_time_count, on_time_percentage,
                 time_to_3_percentage, time_to_5_percentage, time_to_10_percentage,
                 time_to_15_percentage, time_to_30_percentage,
                 avg_delay_minutes, median_delay_minutes, max_delay_minutes,
                 std_delay_minutes,
                 delays_0_5_count, delays_5_15_count, delays_15_30_count,
                 delays_30_60_count, delays_60_plus_count,
                 cancelled_count, cancelled_percentage,
                 reliability_score, reliability_grade,
                 hourly_stats, day_of_week_stats)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stat.origin)
        .bind(&stat.destination)
        .bind(stat.calculation_date.to_string())
        .bind(stat.data_start_date.map(|d| d.to_string()))
        .bind(stat.data_end_date.map(|d| d.to_string()))
        .bind(stat.total_services)
        .bind(stat.on_time_count)
        .bind(stat.on_time_percentage)
        .bind(stat.time_to_3_percentage)
        .bind(stat.time_to_5_percentage)
        .bind(stat.time_to_10_percentage)
        .bind(stat.time_to_15_percentage)
        .bind(stat.time_to_30_percentage)
        .bind(stat.avg_delay_minutes)
        .bind(stat.median_delay_minutes)
        .bind(stat.max_delay_minutes)
        .bind(stat.std_delay_minutes)
        .bind(stat.delays_0_5_count)
        .bind(stat.delays_5_15_count)
        .bind(stat.delays_15_30_count)
        .bind(stat.delays_30_60_count)
        .bind(stat.delays_60_plus_count)
        .bind(stat.cancelled_count)
        .bind(stat.cancelled_percentage)
        .bind(stat.reliability_score)
        .bind(&stat.reliability_grade)
        .bind(&stat.hourly_stats)
        .bind(&stat.day_of_week_stats)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn replace_toc_stat(&self, stat: &TocStatRow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM toc_statistics WHERE toc_code = ? AND calculation_date = ?")
            .bind(&stat.toc_code)
            .bind(stat.calculation_date.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO toc_statistics
                (toc_code, calculation_date, total_services, total_routes_served,
                 on_time_percentage, ppm_5_percentage, ppm_10_percentage,
                 ppm_15_percentage, ppm_30_percentage,
                 avg_delay_minutes, median_delay_minutes, cancelled_percentage,
                 reliability_score, reliability_grade)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stat.toc_code)
        .bind(stat.calculation_date.to_string())
        .bind(stat.total_services)
        .bind(stat.total_routes_served)
        .bind(stat.on_time_percentage)
        .bind(stat.ppm_5_percentage)
        .bind(stat.ppm_10_percentage)
        .bind(stat.ppm_15_percentage)
        .bind(stat.ppm_30_percentage)
        .bind(stat.avg_delay_minutes)
        .bind(stat.median_delay_minutes)
        .bind(stat.cancelled_percentage)
        .bind(stat.reliability_score)
        .bind(&stat.reliability_grade)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn replace_time_slot_stats(
        &self,
        origin: &str,
        destination: &str,
        calculation_date: NaiveDate,
        slots: &[TimeSlotRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM time_slot_statistics
             WHERE origin = ? AND destination = ? AND calculation_date = ?",
        )
        .bind(origin)
        .bind(destination)
        .bind(calculation_date.to_string())
        .execute(&mut *tx)
        .await?;
        for slot in slots {
            sqlx::query(
                r#"
                INSERT INTO time_slot_statistics
                    (origin, destination, hour_of_day, day_of_week, calculation_date,
                     sample_size, on_time_percentage, avg_delay_minutes)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(origin)
            .bind(destination)
            .bind(slot.hour_of_day)
            .bind(slot.day_of_week)
            .bind(calculation_date.to_string())
            .bind(slot.sample_size)
            .bind(slot.on_time_percentage)
            .bind(slot.avg_delay_minutes)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- prediction reads -------------------------------------------------

    pub async fn latest_route_stat(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Option<RouteStatRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM route_statistics
             WHERE origin = ? AND destination = ?
             ORDER BY calculation_date DESC LIMIT 1",
        )
        .bind(origin)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RouteStatRow::from_row).transpose()
    }

    pub async fn latest_toc_stat(&self, toc_code: &str) -> Result<Option<TocStatRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM toc_statistics
             WHERE toc_code = ? ORDER BY calculation_date DESC LIMIT 1",
        )
        .bind(toc_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TocStatRow::from_row).transpose()
    }

    /// Unweighted average across the latest row per route.
    pub async fn network_average(&self) -> Result<Option<NetworkAverage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT AVG(on_time_percentage) AS on_time,
                   AVG(time_to_5_percentage) AS t5,
                   AVG(time_to_15_percentage) AS t15,
                   AVG(time_to_30_percentage) AS t30,
                   AVG(avg_delay_minutes) AS avg_delay,
                   SUM(total_services) AS sample
            FROM route_statistics rs
            WHERE calculation_date = (
                SELECT MAX(calculation_date) FROM route_statistics inner_rs
                WHERE inner_rs.origin = rs.origin AND inner_rs.destination = rs.destination
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let sample: Option<i64> = row.get("sample");
        match sample {
            Some(sample) if sample > 0 => Ok(Some(NetworkAverage {
                on_time_percentage: row.get("on_time"),
                time_to_5_percentage: row.get("t5"),
                time_to_15_percentage: row.get("t15"),
                time_to_30_percentage: row.get("t30"),
                avg_delay_minutes: row.get("avg_delay"),
                sample_size: sample,
            })),
            _ => Ok(None),
        }
    }

    pub async fn top_routes(&self, limit: i64) -> Result<Vec<RouteStatRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM route_statistics rs
            WHERE calculation_date = (
                SELECT MAX(calculation_date) FROM route_statistics inner_rs
                WHERE inner_rs.origin = rs.origin AND inner_rs.destination = rs.destination
            )
            ORDER BY total_services DESC, origin, destination
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RouteStatRow::from_row).collect()
    }

    // --- fares ------------------------------------------------------------

    /// Upsert decoded fares. Real-feed rows displace simulated rows, never
    /// the other way round.
    pub async fn upsert_fares(&self, fares: &[FareRecord]) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for fare in fares {
            let result = sqlx::query(
                r#"
                INSERT INTO fare_cache
                    (origin, destination, ticket_type, ticket_class,
                     adult_pence, child_pence, valid_from, valid_until,
                     route_restriction, toc_code, data_source, cached_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (origin, destination, ticket_type, ticket_class)
                DO UPDATE SET
                    adult_pence = excluded.adult_pence,
                    child_pence = excluded.child_pence,
                    valid_from = excluded.valid_from,
                    valid_until = excluded.valid_until,
                    route_restriction = excluded.route_restriction,
                    toc_code = excluded.toc_code,
                    data_source = excluded.data_source,
                    cached_at = excluded.cached_at
                WHERE excluded.data_source = 'NRDP_REAL'
                   OR fare_cache.data_source <> 'NRDP_REAL'
                "#,
            )
            .bind(&fare.origin)
            .bind(&fare.destination)
            .bind(fare.ticket_type.as_str())
            .bind(fare.ticket_class.as_str())
            .bind(fare.adult_pence)
            .bind(fare.child_pence)
            .bind(fare.valid_from.map(|d| d.to_string()))
            .bind(fare.valid_until.map(|d| d.to_string()))
            .bind(&fare.route_restriction)
            .bind(&fare.toc_code)
            .bind(&fare.data_source)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        info!(written, total = fares.len(), "Fare rows upserted");
        Ok(written)
    }

    pub async fn fares_for_route(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Vec<FareRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT ticket_type, ticket_class, adult_pence, child_pence,
                    route_restriction, toc_code, data_source, cached_at
             FROM fare_cache
             WHERE origin = ? AND destination = ?
             ORDER BY adult_pence",
        )
        .bind(origin)
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FareRow {
                ticket_type: r.get("ticket_type"),
                ticket_class: r.get("ticket_class"),
                adult_pence: r.get("adult_pence"),
                child_pence: r.get("child_pence"),
                route_restriction: r.get("route_restriction"),
                toc_code: r.get("toc_code"),
                data_source: r.get("data_source"),
                cached_at: r.get("cached_at"),
            })
            .collect())
    }

    // --- response cache ---------------------------------------------------

    pub async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "SELECT payload FROM prediction_cache WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        if row.is_some() {
            sqlx::query(
                "UPDATE prediction_cache SET hit_count = hit_count + 1 WHERE cache_key = ?",
            )
            .bind(key)
            .execute(&self.pool)
            .await?;
        }
        Ok(row.map(|r| r.get("payload")))
    }

    /// Last writer wins on the same key.
    pub async fn cache_put(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl.as_secs() as i64);
        sqlx::query(
            r#"
            INSERT INTO prediction_cache (cache_key, payload, created_at, expires_at, hit_count)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT (cache_key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(now.to_rfc3339())
        .bind(expires.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_prune(&self) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("DELETE FROM prediction_cache WHERE expires_at <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- feedback ---------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_feedback(
        &self,
        feedback_id: &str,
        request_id: &str,
        actual_delay_minutes: Option<i64>,
        was_cancelled: bool,
        rating: i64,
        comment: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feedback
                (feedback_id, request_id, actual_delay_minutes, was_cancelled,
                 rating, comment, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(feedback_id)
        .bind(request_id)
        .bind(actual_delay_minutes)
        .bind(was_cancelled)
        .bind(rating)
        .bind(comment)
        .bind(received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- route stops ------------------------------------------------------

    /// Ordered intermediate stops for a route. A future-timetable import
    /// takes precedence; otherwise the most recently observed service that
    /// calls at both endpoints is reconstructed.
    pub async fn route_stops(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Option<(Vec<RouteStopRow>, &'static str)>, StoreError> {
        let timetable = sqlx::query(
            "SELECT location, stop_sequence, scheduled_arrival, scheduled_departure
             FROM timetable_stops
             WHERE origin = ? AND destination = ?
             ORDER BY stop_sequence",
        )
        .bind(origin)
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        if !timetable.is_empty() {
            let stops = timetable.into_iter().map(RouteStopRow::from_row).collect();
            return Ok(Some((stops, "timetable")));
        }

        let rid: Option<String> = sqlx::query(
            r#"
            SELECT sd.rid FROM service_details sd
            WHERE sd.location = ?
              AND sd.rid IN (SELECT rid FROM service_details WHERE location = ?)
            ORDER BY sd.date_of_service DESC, sd.rid DESC
            LIMIT 1
            "#,
        )
        .bind(origin)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?
        .map(|r| r.get("rid"));
        let Some(rid) = rid else {
            return Ok(None);
        };

        let observed = sqlx::query(
            r#"
            SELECT location, stop_sequence, scheduled_arrival, scheduled_departure
            FROM service_details
            WHERE rid = ?
              AND stop_sequence >= (SELECT stop_sequence FROM service_details
                                    WHERE rid = ? AND location = ?)
              AND stop_sequence <= (SELECT stop_sequence FROM service_details
                                    WHERE rid = ? AND location = ?)
            ORDER BY stop_sequence
            "#,
        )
        .bind(&rid)
        .bind(&rid)
        .bind(origin)
        .bind(&rid)
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        if observed.is_empty() {
            return Ok(None);
        }
        let stops = observed.into_iter().map(RouteStopRow::from_row).collect();
        Ok(Some((stops, "observed")))
    }
}

// --- row types ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StopObservation {
    pub rid: String,
    pub date_of_service: NaiveDate,
    pub toc_code: String,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub arrival_delay_minutes: Option<i64>,
    pub cancellation_reason: Option<String>,
}

impl StopObservation {
    fn from_row(row: sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        Ok(Self {
            rid: row.get("rid"),
            date_of_service: parse_date(row.get("date_of_service"))?,
            toc_code: row.get("toc_code"),
            scheduled_departure: parse_opt_timestamp(row.get("scheduled_departure"))?,
            scheduled_arrival: parse_opt_timestamp(row.get("scheduled_arrival"))?,
            arrival_delay_minutes: row.get("arrival_delay_minutes"),
            cancellation_reason: row.get("cancellation_reason"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RouteStatRow {
    pub origin: String,
    pub destination: String,
    pub calculation_date: NaiveDate,
    pub data_start_date: Option<NaiveDate>,
    pub data_end_date: Option<NaiveDate>,
    pub total_services: i64,
    pub on_time_count: i64,
    pub on_time_percentage: f64,
    pub time_to_3_percentage: f64,
    pub time_to_5_percentage: f64,
    pub time_to_10_percentage: f64,
    pub time_to_15_percentage: f64,
    pub time_to_30_percentage: f64,
    pub avg_delay_minutes: f64,
    pub median_delay_minutes: f64,
    pub max_delay_minutes: i64,
    pub std_delay_minutes: f64,
    pub delays_0_5_count: i64,
    pub delays_5_15_count: i64,
    pub delays_15_30_count: i64,
    pub delays_30_60_count: i64,
    pub delays_60_plus_count: i64,
    pub cancelled_count: i64,
    pub cancelled_percentage: f64,
    pub reliability_score: f64,
    pub reliability_grade: String,
    pub hourly_stats: String,
    pub day_of_week_stats: String,
}

impl RouteStatRow {
    fn from_row(row: sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        Ok(Self {
            origin: row.get("origin"),
            destination: row.get("destination"),
            calculation_date: parse_date(row.get("calculation_date"))?,
            data_start_date: parse_opt_date(row.get("data_start_date"))?,
            data_end_date: parse_opt_date(row.get("data_end_date"))?,
            total_services: row.get("total_services"),
            on_time_count: row.get("on_time_count"),
            on_time_percentage: row.get("on_time_percentage"),
            time_to_3_percentage: row.get("time_to_3_percentage"),
            time_to_5_percentage: row.get("time_to_5_percentage"),
            time_to_10_percentage: row.get("time_to_10_percentage"),
            time_to_15_percentage: row.get("time_to_15_percentage"),
            time_to_30_percentage: row.get("time_to_30_percentage"),
            avg_delay_minutes: row.get("avg_delay_minutes"),
            median_delay_minutes: row.get("median_delay_minutes"),
            max_delay_minutes: row.get("max_delay_minutes"),
            std_delay_minutes: row.get("std_delay_minutes"),
            delays_0_5_count: row.get("delays_0_5_count"),
            delays_5_15_count: row.get("delays_5_15_count"),
            delays_15_30_count: row.get("delays_15_30_count"),
            delays_30_60_count: row.get("delays_30_60_count"),
            delays_60_plus_count: row.get("delays_60_plus_count"),
            cancelled_count: row.get("cancelled_count"),
            cancelled_percentage: row.get("cancelled_percentage"),
            reliability_score: row.get("reliability_score"),
            reliability_grade: row.get("reliability_grade"),
            hourly_stats: row.get("hourly_stats"),
            day_of_week_stats: row.get("day_of_week_stats"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TocStatRow {
    pub toc_code: String,
    pub calculation_date: NaiveDate,
    pub total_services: i64,
    pub total_routes_served: i64,
    pub on_time_percentage: f64,
    pub ppm_5_percentage: f64,
    pub ppm_10_percentage: f64,
    pub ppm_15_percentage: f64,
    pub ppm_30_percentage: f64,
    pub avg_delay_minutes: f64,
    pub median_delay_minutes: f64,
    pub cancelled_percentage: f64,
    pub reliability_score: f64,
    pub reliability_grade: String,
}

impl TocStatRow {
    fn from_row(row: sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        Ok(Self {
            toc_code: row.get("toc_code"),
            calculation_date: parse_date(row.get("calculation_date"))?,
            total_services: row.get("total_services"),
            total_routes_served: row.get("total_routes_served"),
            on_time_percentage: row.get("on_time_percentage"),
            ppm_5_percentage: row.get("ppm_5_percentage"),
            ppm_10_percentage: row.get("ppm_10_percentage"),
            ppm_15_percentage: row.get("ppm_15_percentage"),
            ppm_30_percentage: row.get("ppm_30_percentage"),
            avg_delay_minutes: row.get("avg_delay_minutes"),
            median_delay_minutes: row.get("median_delay_minutes"),
            cancelled_percentage: row.get("cancelled_percentage"),
            reliability_score: row.get("reliability_score"),
            reliability_grade: row.get("reliability_grade"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TimeSlotRow {
    pub hour_of_day: i64,
    /// 0 = Monday .. 6 = Sunday, -1 = all days.
    pub day_of_week: i64,
    pub sample_size: i64,
    pub on_time_percentage: f64,
    pub avg_delay_minutes: f64,
}

#[derive(Debug, Clone)]
pub struct NetworkAverage {
    pub on_time_percentage: f64,
    pub time_to_5_percentage: f64,
    pub time_to_15_percentage: f64,
    pub time_to_30_percentage: f64,
    pub avg_delay_minutes: f64,
    pub sample_size: i64,
}

#[derive(Debug, Clone)]
pub struct FareRow {
    pub ticket_type: String,
    pub ticket_class: String,
    pub adult_pence: i64,
    pub child_pence: Option<i64>,
    pub route_restriction: Option<String>,
    pub toc_code: Option<String>,
    pub data_source: String,
    pub cached_at: String,
}

#[derive(Debug, Clone)]
pub struct RouteStopRow {
    pub location: String,
    pub stop_sequence: i64,
    pub scheduled_arrival: Option<String>,
    pub scheduled_departure: Option<String>,
}

impl RouteStopRow {
    fn from_row(row: sqlx::sqlite::SqliteRow) -> Self {
        Self {
            location: row.get("location"),
            stop_sequence: row.get("stop_sequence"),
            scheduled_arrival: row.get("scheduled_arrival"),
            scheduled_departure: row.get("scheduled_departure"),
        }
    }
}

fn parse_date(s: String) -> Result<NaiveDate, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad date: {s}")))
}

fn parse_opt_date(s: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    s.map(parse_date).transpose()
}

fn parse_opt_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| StoreError::Corrupt(format!("bad timestamp: {s}")))
    })
    .transpose()
}
