//! Offline statistics aggregation.
//!
//! Recomputes route, operator, and time-slot statistics from stored
//! observations. Each route is processed independently: a failure is logged
//! and the route's previous row stays canonical while the rest proceed.
//! Re-running on an unchanged store reproduces every numeric field.

pub mod score;

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Timelike, Utc};
use chrono_tz::Europe::London;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::{
    RouteStatRow, StopObservation, Store, StoreError, TimeSlotRow, TocStatRow,
};

/// Delays above this are "severe" for scoring purposes, minutes.
const SEVERE_DELAY_MINUTES: i64 = 60;

/// Per-hour or per-weekday breakdown bucket, serialized into the stats row.
#[derive(Debug, Default, Clone, Serialize)]
struct SliceStats {
    count: usize,
    avg_delay: f64,
    on_time_percentage: f64,
}

pub struct Aggregator {
    store: Store,
    calculation_date: NaiveDate,
}

#[derive(Debug, Default)]
pub struct AggregationSummary {
    pub routes_computed: usize,
    pub routes_skipped: usize,
    pub tocs_computed: usize,
}

impl Aggregator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            calculation_date: Utc::now().date_naive(),
        }
    }

    /// Pin the calculation date (tests; backfills).
    pub fn with_calculation_date(store: Store, date: NaiveDate) -> Self {
        Self {
            store,
            calculation_date: date,
        }
    }

    pub async fn recompute(&self) -> Result<AggregationSummary, StoreError> {
        let mut summary = AggregationSummary::default();

        let routes = self.store.distinct_routes().await?;
        info!(routes = routes.len(), "Recomputing route statistics");
        for (origin, destination) in &routes {
            match self.recompute_route(origin, destination).await {
                Ok(true) => summary.routes_computed += 1,
                Ok(false) => summary.routes_skipped += 1,
                Err(e) => {
                    // Prior statistics for this route remain canonical.
                    warn!(origin, destination, error = %e, "Route aggregation failed, keeping previous row");
                    summary.routes_skipped += 1;
                }
            }
        }

        let tocs = self.store.distinct_tocs().await?;
        info!(tocs = tocs.len(), "Recomputing operator statistics");
        for toc in &tocs {
            match self.recompute_toc(toc).await {
                Ok(true) => summary.tocs_computed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(toc, error = %e, "Operator aggregation failed, keeping previous row");
                }
            }
        }

        info!(
            routes_computed = summary.routes_computed,
            routes_skipped = summary.routes_skipped,
            tocs_computed = summary.tocs_computed,
            "Aggregation complete"
        );
        Ok(summary)
    }

    async fn recompute_route(&self, origin: &str, destination: &str) -> Result<bool, StoreError> {
        let observations = self.store.arrival_observations(origin, destination).await?;
        let Some(stat) = build_route_stat(origin, destination, self.calculation_date, &observations)
        else {
            return Ok(false);
        };
        self.store.replace_route_stat(&stat).await?;

        let slots = build_time_slots(&observations);
        self.store
            .replace_time_slot_stats(origin, destination, self.calculation_date, &slots)
            .await?;
        Ok(true)
    }

    async fn recompute_toc(&self, toc_code: &str) -> Result<bool, StoreError> {
        let observations = self.store.toc_observations(toc_code).await?;
        let routes_served = self.store.routes_served_by(toc_code).await?;
        let Some(stat) =
            build_toc_stat(toc_code, self.calculation_date, routes_served, &observations)
        else {
            return Ok(false);
        };
        self.store.replace_toc_stat(&stat).await?;
        Ok(true)
    }
}

/// The histogram's first bucket absorbs early arrivals so the buckets always
/// sum to the number of observed delays.
fn histogram_bucket(delay: i64) -> usize {
    match delay {
        d if d < 5 => 0,
        d if d < 15 => 1,
        d if d < 30 => 2,
        d if d < 60 => 3,
        _ => 4,
    }
}

pub fn build_route_stat(
    origin: &str,
    destination: &str,
    calculation_date: NaiveDate,
    observations: &[StopObservation],
) -> Option<RouteStatRow> {
    let delays: Vec<i64> = observations
        .iter()
        .filter_map(|o| o.arrival_delay_minutes)
        .collect();
    if delays.is_empty() {
        return None;
    }
    let total = delays.len() as f64;

    let count_within = |limit: i64| delays.iter().filter(|d| **d <= limit).count();
    let on_time_count = count_within(1);
    let pct = |count: usize| (count as f64 / total) * 100.0;

    let mut histogram = [0i64; 5];
    for delay in &delays {
        histogram[histogram_bucket(*delay)] += 1;
    }

    let cancelled_count = observations
        .iter()
        .filter(|o| o.cancellation_reason.is_some())
        .count();
    let cancelled_pct = (cancelled_count as f64 / observations.len() as f64) * 100.0;
    let severe_count = delays.iter().filter(|d| **d > SEVERE_DELAY_MINUTES).count();
    let severe_pct = pct(severe_count);

    let ppm5 = pct(count_within(5));
    let ppm10 = pct(count_within(10));
    let score = score::reliability_score(ppm5, ppm10, cancelled_pct, severe_pct);

    let delay_floats: Vec<f64> = delays.iter().map(|d| *d as f64).collect();
    let dates: Vec<NaiveDate> = observations.iter().map(|o| o.date_of_service).collect();

    Some(RouteStatRow {
        origin: origin.to_string(),
        destination: destination.to_string(),
        calculation_date,
        data_start_date: dates.iter().min().copied(),
        data_end_date: dates.iter().max().copied(),
        total_services: delays.len() as i64,
        on_time_count: on_time_count as i64,
        on_time_percentage: pct(on_time_count),
        time_to_3_percentage: pct(count_within(3)),
        time_to_5_percentage: ppm5,
        time_to_10_percentage: ppm10,
        time_to_15_percentage: pct(count_within(15)),
        time_to_30_percentage: pct(count_within(30)),
        avg_delay_minutes: score::mean(&delay_floats),
        median_delay_minutes: score::median(&delays),
        max_delay_minutes: delays.iter().max().copied().unwrap_or(0),
        std_delay_minutes: score::stddev(&delay_floats),
        delays_0_5_count: histogram[0],
        delays_5_15_count: histogram[1],
        delays_15_30_count: histogram[2],
        delays_30_60_count: histogram[3],
        delays_60_plus_count: histogram[4],
        cancelled_count: cancelled_count as i64,
        cancelled_percentage: cancelled_pct,
        reliability_score: score,
        reliability_grade: score::grade(score).to_string(),
        hourly_stats: breakdown_json(observations, |o| {
            o.scheduled_departure
                .map(|t| t.with_timezone(&London).hour())
        }),
        day_of_week_stats: breakdown_json(observations, |o| {
            Some(o.date_of_service.weekday().num_days_from_monday())
        }),
    })
}

pub fn build_toc_stat(
    toc_code: &str,
    calculation_date: NaiveDate,
    routes_served: i64,
    observations: &[StopObservation],
) -> Option<TocStatRow> {
    let delays: Vec<i64> = observations
        .iter()
        .filter_map(|o| o.arrival_delay_minutes)
        .collect();
    if delays.is_empty() {
        return None;
    }
    let total = delays.len() as f64;
    let pct = |count: usize| (count as f64 / total) * 100.0;
    let count_within = |limit: i64| delays.iter().filter(|d| **d <= limit).count();

    let cancelled_count = observations
        .iter()
        .filter(|o| o.cancellation_reason.is_some())
        .count();
    let cancelled_pct = (cancelled_count as f64 / observations.len() as f64) * 100.0;
    let severe_pct = pct(delays.iter().filter(|d| **d > SEVERE_DELAY_MINUTES).count());

    let ppm5 = pct(count_within(5));
    let ppm10 = pct(count_within(10));
    let score = score::reliability_score(ppm5, ppm10, cancelled_pct, severe_pct);
    let delay_floats: Vec<f64> = delays.iter().map(|d| *d as f64).collect();

    Some(TocStatRow {
        toc_code: toc_code.to_string(),
        calculation_date,
        total_services: delays.len() as i64,
        total_routes_served: routes_served,
        on_time_percentage: pct(count_within(1)),
        ppm_5_percentage: ppm5,
        ppm_10_percentage: ppm10,
        ppm_15_percentage: pct(count_within(15)),
        ppm_30_percentage: pct(count_within(30)),
        avg_delay_minutes: score::mean(&delay_floats),
        median_delay_minutes: score::median(&delays),
        cancelled_percentage: cancelled_pct,
        reliability_score: score,
        reliability_grade: score::grade(score).to_string(),
    })
}

/// Time-slot rows: one per observed departure hour, both per-weekday and
/// collapsed across days (day_of_week = -1).
pub fn build_time_slots(observations: &[StopObservation]) -> Vec<TimeSlotRow> {
    let mut grouped: BTreeMap<(i64, i64), Vec<i64>> = BTreeMap::new();
    for obs in observations {
        let (Some(departure), Some(delay)) = (obs.scheduled_departure, obs.arrival_delay_minutes)
        else {
            continue;
        };
        let hour = departure.with_timezone(&London).hour() as i64;
        let dow = obs.date_of_service.weekday().num_days_from_monday() as i64;
        grouped.entry((hour, dow)).or_default().push(delay);
        grouped.entry((hour, -1)).or_default().push(delay);
    }

    grouped
        .into_iter()
        .map(|((hour, dow), delays)| {
            let total = delays.len() as f64;
            let on_time = delays.iter().filter(|d| **d <= 1).count() as f64;
            let floats: Vec<f64> = delays.iter().map(|d| *d as f64).collect();
            TimeSlotRow {
                hour_of_day: hour,
                day_of_week: dow,
                sample_size: delays.len() as i64,
                on_time_percentage: (on_time / total) * 100.0,
                avg_delay_minutes: score::mean(&floats),
            }
        })
        .collect()
}

fn breakdown_json<F>(observations: &[StopObservation], key: F) -> String
where
    F: Fn(&StopObservation) -> Option<u32>,
{
    let mut grouped: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
    for obs in observations {
        let (Some(k), Some(delay)) = (key(obs), obs.arrival_delay_minutes) else {
            continue;
        };
        grouped.entry(k).or_default().push(delay);
    }
    let slices: BTreeMap<u32, SliceStats> = grouped
        .into_iter()
        .map(|(k, delays)| {
            let total = delays.len() as f64;
            let on_time = delays.iter().filter(|d| **d <= 1).count() as f64;
            let floats: Vec<f64> = delays.iter().map(|d| *d as f64).collect();
            (
                k,
                SliceStats {
                    count: delays.len(),
                    avg_delay: score::mean(&floats),
                    on_time_percentage: (on_time / total) * 100.0,
                },
            )
        })
        .collect();
    serde_json::to_string(&slices).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::normalize::parse_hhmm_utc;

    fn obs(
        date: NaiveDate,
        hhmm: &str,
        delay: Option<i64>,
        cancelled: bool,
    ) -> StopObservation {
        StopObservation {
            rid: format!("R{hhmm}"),
            date_of_service: date,
            toc_code: "VT".into(),
            scheduled_departure: parse_hhmm_utc(date, hhmm),
            scheduled_arrival: parse_hhmm_utc(date, hhmm),
            arrival_delay_minutes: delay,
            cancellation_reason: cancelled.then(|| "CANC".to_string()),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn percentages_form_a_monotone_ladder() {
        let day = date(2025, 1, 15);
        let delays = [0, 1, 2, 4, 6, 9, 12, 20, 40, 70];
        let observations: Vec<_> = delays
            .iter()
            .map(|d| obs(day, "0900", Some(*d), false))
            .collect();
        let stat = build_route_stat("EUS", "MAN", day, &observations).unwrap();

        assert!(stat.on_time_percentage <= stat.time_to_5_percentage);
        assert!(stat.time_to_5_percentage <= stat.time_to_10_percentage);
        assert!(stat.time_to_10_percentage <= stat.time_to_15_percentage);
        assert!(stat.time_to_15_percentage <= stat.time_to_30_percentage);
        assert!(stat.time_to_30_percentage <= 100.0);
        assert_eq!(stat.on_time_percentage, 20.0);
        assert_eq!(stat.time_to_5_percentage, 40.0);
        assert_eq!(stat.max_delay_minutes, 70);
    }

    #[test]
    fn histogram_sums_to_total_even_with_early_arrivals() {
        let day = date(2025, 1, 15);
        let delays = [-10, -2, 0, 3, 7, 18, 35, 80];
        let observations: Vec<_> = delays
            .iter()
            .map(|d| obs(day, "0900", Some(*d), false))
            .collect();
        let stat = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        let sum = stat.delays_0_5_count
            + stat.delays_5_15_count
            + stat.delays_15_30_count
            + stat.delays_30_60_count
            + stat.delays_60_plus_count;
        assert_eq!(sum, stat.total_services);
        assert_eq!(stat.delays_0_5_count, 4);
        assert_eq!(stat.delays_60_plus_count, 1);
    }

    #[test]
    fn reliability_grade_reflects_score() {
        let day = date(2025, 1, 15);
        // Everything on time: PPM5 = PPM10 = 100, no cancellations.
        let observations: Vec<_> = (0..10).map(|_| obs(day, "0900", Some(0), false)).collect();
        let stat = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        assert_eq!(stat.reliability_score, 100.0);
        assert_eq!(stat.reliability_grade, "A");
    }

    #[test]
    fn cancellations_lower_the_score() {
        let day = date(2025, 1, 15);
        let mut observations: Vec<_> =
            (0..8).map(|_| obs(day, "0900", Some(0), false)).collect();
        observations.push(obs(day, "1000", None, true));
        observations.push(obs(day, "1100", None, true));
        let stat = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        assert_eq!(stat.cancelled_count, 2);
        assert_eq!(stat.cancelled_percentage, 20.0);
        assert!(stat.reliability_score < 100.0);
    }

    #[test]
    fn routes_without_delays_produce_no_row() {
        let day = date(2025, 1, 15);
        let observations = vec![obs(day, "0900", None, true)];
        assert!(build_route_stat("EUS", "MAN", day, &observations).is_none());
    }

    #[test]
    fn rerun_on_unchanged_input_is_identical() {
        let day = date(2025, 1, 15);
        let observations: Vec<_> = [3, 1, 3, 12, 3, 7]
            .iter()
            .map(|d| obs(day, "0900", Some(*d), false))
            .collect();
        let a = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        let b = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        assert_eq!(a.median_delay_minutes, b.median_delay_minutes);
        assert_eq!(a.avg_delay_minutes, b.avg_delay_minutes);
        assert_eq!(a.std_delay_minutes, b.std_delay_minutes);
        assert_eq!(a.hourly_stats, b.hourly_stats);
        assert_eq!(a.day_of_week_stats, b.day_of_week_stats);
    }

    #[test]
    fn hourly_breakdown_uses_london_hours() {
        // July: 0930 civil is 0830 UTC; the breakdown must key on 9, not 8.
        let day = date(2025, 7, 15);
        let observations: Vec<_> = (0..3).map(|_| obs(day, "0930", Some(2), false)).collect();
        let stat = build_route_stat("EUS", "MAN", day, &observations).unwrap();
        let hourly: serde_json::Value = serde_json::from_str(&stat.hourly_stats).unwrap();
        assert!(hourly.get("9").is_some());
        assert!(hourly.get("8").is_none());
    }

    #[test]
    fn time_slots_include_all_days_rollup() {
        let mon = date(2025, 1, 13);
        let sat = date(2025, 1, 18);
        let observations = vec![
            obs(mon, "0900", Some(5), false),
            obs(sat, "0900", Some(15), false),
        ];
        let slots = build_time_slots(&observations);
        let rollup = slots
            .iter()
            .find(|s| s.hour_of_day == 9 && s.day_of_week == -1)
            .unwrap();
        assert_eq!(rollup.sample_size, 2);
        assert!((rollup.avg_delay_minutes - 10.0).abs() < 1e-9);
        assert!(slots.iter().any(|s| s.day_of_week == 0));
        assert!(slots.iter().any(|s| s.day_of_week == 5));
    }
}
