//! Normalization of raw HSP payloads into storable records.
//!
//! Upstream times are HHMM strings in UK civil time against the service
//! date. They are localized in Europe/London (DST-aware: ambiguous clock
//! times take the earlier offset, times inside the spring-forward gap roll
//! an hour ahead) and stored as UTC. Delays are computed once here; nothing
//! downstream recomputes them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::London;

use crate::providers::hsp::types::{ServiceDetailsResponse, ServiceMetric};

/// Plausibility window for a computed delay, minutes.
pub const MIN_DELAY_MINUTES: i32 = -180;
pub const MAX_DELAY_MINUTES: i32 = 720;

/// A stop whose actual time precedes its scheduled time by more than this
/// is a next-day roll-over, not a very early train.
const ROLLOVER_THRESHOLD_HOURS: i64 = 12;

#[derive(Debug, Clone)]
pub struct NormalizedMetric {
    pub origin: String,
    pub destination: String,
    pub scheduled_departure: Option<String>,
    pub scheduled_arrival: Option<String>,
    pub toc_code: String,
    pub matched_services_count: i64,
    pub rids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NormalizedStop {
    pub rid: String,
    pub date_of_service: NaiveDate,
    pub toc_code: String,
    pub location: String,
    pub stop_sequence: i64,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub departure_delay_minutes: Option<i32>,
    pub arrival_delay_minutes: Option<i32>,
    pub cancellation_reason: Option<String>,
}

/// Per-reason drop counters, persisted to data_quality_metrics.
#[derive(Debug, Default, Clone)]
pub struct DropCounts {
    reasons: BTreeMap<&'static str, u64>,
}

impl DropCounts {
    pub fn bump(&mut self, reason: &'static str) {
        *self.reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: DropCounts) {
        for (reason, count) in other.reasons {
            *self.reasons.entry(reason).or_insert(0) += count;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.reasons.iter().map(|(r, c)| (*r, *c))
    }

    pub fn total(&self) -> u64 {
        self.reasons.values().sum()
    }
}

pub fn is_valid_crs(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Localize an HHMM string against a service date and convert to UTC.
pub fn parse_hhmm_utc(date: NaiveDate, hhmm: &str) -> Option<DateTime<Utc>> {
    if hhmm.len() != 4 || !hhmm.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = hhmm[..2].parse().ok()?;
    let minute: u32 = hhmm[2..].parse().ok()?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    let local = match London.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        // GMT->BST ambiguity: take the earlier offset.
        chrono::LocalResult::Ambiguous(earlier, _) => earlier,
        // Inside the spring-forward gap: the clock time never existed,
        // roll an hour ahead.
        chrono::LocalResult::None => London
            .from_local_datetime(&(naive + Duration::hours(1)))
            .single()?,
    };
    Some(local.with_timezone(&Utc))
}

/// Correct a next-day roll-over, then compute the delay in whole minutes.
pub fn compute_delay(
    scheduled: Option<DateTime<Utc>>,
    actual: Option<DateTime<Utc>>,
) -> (Option<DateTime<Utc>>, Option<i32>) {
    let (Some(sched), Some(mut act)) = (scheduled, actual) else {
        return (actual, None);
    };
    if act < sched - Duration::hours(ROLLOVER_THRESHOLD_HOURS) {
        act += Duration::hours(24);
    }
    let minutes = ((act - sched).num_seconds() as f64 / 60.0).round() as i32;
    (Some(act), Some(minutes))
}

/// Normalize one serviceMetrics entry. Returns None (and counts the reason)
/// when structurally unusable.
pub fn normalize_metric(
    service: &ServiceMetric,
    drops: &mut DropCounts,
) -> Option<NormalizedMetric> {
    let attrs = &service.attributes;
    let (Some(origin), Some(destination), Some(toc_code)) = (
        attrs.origin_location.clone(),
        attrs.destination_location.clone(),
        attrs.toc_code.clone(),
    ) else {
        drops.bump("metric_missing_fields");
        return None;
    };
    if !is_valid_crs(&origin) || !is_valid_crs(&destination) {
        drops.bump("malformed_crs");
        return None;
    }
    let matched = attrs
        .matched_services
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Some(NormalizedMetric {
        origin,
        destination,
        scheduled_departure: attrs.gbtt_ptd.clone(),
        scheduled_arrival: attrs.gbtt_pta.clone(),
        toc_code,
        matched_services_count: matched,
        rids: attrs.rids.clone(),
    })
}

/// Normalize a serviceDetails response into per-stop records.
pub fn normalize_details(
    response: &ServiceDetailsResponse,
    drops: &mut DropCounts,
) -> Vec<NormalizedStop> {
    let attrs = &response.attributes;
    let (Some(rid), Some(date_str), Some(toc_code)) = (
        attrs.rid.clone(),
        attrs.date_of_service.clone(),
        attrs.toc_code.clone(),
    ) else {
        drops.bump("missing_rid");
        return Vec::new();
    };
    let Ok(date) = date_str.parse::<NaiveDate>() else {
        drops.bump("invalid_service_date");
        return Vec::new();
    };

    let mut stops = Vec::with_capacity(attrs.locations.len());
    for (index, loc) in attrs.locations.iter().enumerate() {
        let Some(location) = loc.location.clone() else {
            drops.bump("malformed_crs");
            continue;
        };
        if !is_valid_crs(&location) {
            drops.bump("malformed_crs");
            continue;
        }

        let scheduled_departure = loc
            .gbtt_ptd
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| parse_hhmm_utc(date, s));
        let scheduled_arrival = loc
            .gbtt_pta
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| parse_hhmm_utc(date, s));
        let actual_departure = loc
            .actual_td
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| parse_hhmm_utc(date, s));
        let actual_arrival = loc
            .actual_ta
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| parse_hhmm_utc(date, s));

        let (actual_departure, departure_delay) =
            compute_delay(scheduled_departure, actual_departure);
        let (actual_arrival, arrival_delay) = compute_delay(scheduled_arrival, actual_arrival);

        let out_of_range = [departure_delay, arrival_delay]
            .iter()
            .flatten()
            .any(|d| *d < MIN_DELAY_MINUTES || *d > MAX_DELAY_MINUTES);
        if out_of_range {
            drops.bump("delay_out_of_range");
            continue;
        }

        stops.push(NormalizedStop {
            rid: rid.clone(),
            date_of_service: date,
            toc_code: toc_code.clone(),
            location,
            stop_sequence: index as i64,
            scheduled_departure,
            scheduled_arrival,
            actual_departure,
            actual_arrival,
            departure_delay_minutes: departure_delay,
            arrival_delay_minutes: arrival_delay,
            cancellation_reason: loc
                .late_canc_reason
                .clone()
                .filter(|r| !r.is_empty()),
        });
    }
    stops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn winter_time_is_utc() {
        // January: GMT, no offset.
        let dt = parse_hhmm_utc(date(2025, 1, 15), "0930").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-15T09:30:00+00:00");
    }

    #[test]
    fn summer_time_is_offset_by_one_hour() {
        // July: BST, civil 09:30 is 08:30 UTC.
        let dt = parse_hhmm_utc(date(2025, 7, 15), "0930").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-07-15T08:30:00+00:00");
    }

    #[test]
    fn spring_forward_gap_rolls_ahead() {
        // 2025-03-30 01:30 London never exists; it becomes 02:30 BST = 01:30 UTC.
        let dt = parse_hhmm_utc(date(2025, 3, 30), "0130").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-03-30T01:30:00+00:00");
    }

    #[test]
    fn autumn_ambiguity_takes_earlier_offset() {
        // 2025-10-26 01:30 occurs twice; the earlier (BST) reading is 00:30 UTC.
        let dt = parse_hhmm_utc(date(2025, 10, 26), "0130").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-10-26T00:30:00+00:00");
    }

    #[test]
    fn rejects_malformed_hhmm() {
        assert!(parse_hhmm_utc(date(2025, 1, 1), "930").is_none());
        assert!(parse_hhmm_utc(date(2025, 1, 1), "24e0").is_none());
        assert!(parse_hhmm_utc(date(2025, 1, 1), "2561").is_none());
    }

    #[test]
    fn delay_is_rounded_minutes() {
        let sched = parse_hhmm_utc(date(2025, 1, 15), "0900");
        let act = parse_hhmm_utc(date(2025, 1, 15), "0912");
        let (_, delay) = compute_delay(sched, act);
        assert_eq!(delay, Some(12));
    }

    #[test]
    fn early_arrival_is_negative() {
        let sched = parse_hhmm_utc(date(2025, 1, 15), "0900");
        let act = parse_hhmm_utc(date(2025, 1, 15), "0855");
        let (_, delay) = compute_delay(sched, act);
        assert_eq!(delay, Some(-5));
    }

    #[test]
    fn midnight_rollover_corrects_actual() {
        // Scheduled 23:50, actual recorded as 00:20 on the same service date:
        // really 30 minutes late the next calendar day.
        let sched = parse_hhmm_utc(date(2025, 1, 15), "2350");
        let act = parse_hhmm_utc(date(2025, 1, 15), "0020");
        let (corrected, delay) = compute_delay(sched, act);
        assert_eq!(delay, Some(30));
        assert!(corrected.unwrap() > sched.unwrap());
    }

    #[test]
    fn missing_timestamp_yields_null_delay() {
        let sched = parse_hhmm_utc(date(2025, 1, 15), "0900");
        let (_, delay) = compute_delay(sched, None);
        assert_eq!(delay, None);
        let (_, delay) = compute_delay(None, sched);
        assert_eq!(delay, None);
    }

    #[test]
    fn crs_validation() {
        assert!(is_valid_crs("EUS"));
        assert!(!is_valid_crs("eus"));
        assert!(!is_valid_crs("EUST"));
        assert!(!is_valid_crs("E1S"));
    }

    #[test]
    fn out_of_range_delay_drops_stop() {
        let json = r#"{
            "serviceAttributesDetails": {
                "rid": "202501150001",
                "date_of_service": "2025-01-15",
                "toc_code": "VT",
                "locations": [
                    {"location": "MAN", "gbtt_pta": "0900", "actual_ta": "2210"}
                ]
            }
        }"#;
        let response: ServiceDetailsResponse = serde_json::from_str(json).unwrap();
        let mut drops = DropCounts::default();
        let stops = normalize_details(&response, &mut drops);
        assert!(stops.is_empty());
        assert_eq!(drops.total(), 1);
        assert_eq!(drops.iter().next(), Some(("delay_out_of_range", 1)));
    }

    #[test]
    fn details_without_rid_are_dropped() {
        let json = r#"{
            "serviceAttributesDetails": {
                "date_of_service": "2025-01-15",
                "toc_code": "VT",
                "locations": []
            }
        }"#;
        let response: ServiceDetailsResponse = serde_json::from_str(json).unwrap();
        let mut drops = DropCounts::default();
        assert!(normalize_details(&response, &mut drops).is_empty());
        assert_eq!(drops.total(), 1);
    }
}
