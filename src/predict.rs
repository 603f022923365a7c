//! Delay prediction over the pre-computed statistics tables.
//!
//! The engine walks a fallback ladder from the most specific statistics to
//! an industry floor, then scales the chosen base by time-of-day and
//! weekday factors. The ladder level rides along in the result so callers
//! (and tests) can see exactly which data answered.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::{Store, StoreError};

/// A level must have at least this many observations behind it to answer.
pub const MIN_SAMPLE_SIZE: i64 = 30;

/// Industry floor used when no table can answer: national PPM and mean
/// lateness, the most conservative published figures we rely on.
const FLOOR_ON_TIME: f64 = 0.64;
const FLOOR_AVG_DELAY: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LadderLevel {
    /// Route statistics narrowed by the requested operator.
    RouteOperator,
    /// Route statistics regardless of operator.
    Route,
    /// Operator statistics across its whole network.
    OperatorNetwork,
    /// Average across every route we know.
    NetworkAverage,
    /// Hard-coded industry floor.
    IndustryFloor,
}

impl LadderLevel {
    fn rank(self) -> u8 {
        match self {
            LadderLevel::RouteOperator => 1,
            LadderLevel::Route => 2,
            LadderLevel::OperatorNetwork => 3,
            LadderLevel::NetworkAverage => 4,
            LadderLevel::IndustryFloor => 5,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            LadderLevel::RouteOperator => "route and operator history",
            LadderLevel::Route => "route history",
            LadderLevel::OperatorNetwork => "operator network history",
            LadderLevel::NetworkAverage => "network-wide average",
            LadderLevel::IndustryFloor => "industry baseline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Prediction {
    pub expected_delay_minutes: f64,
    pub on_time_probability: f64,
    pub ppm5_probability: f64,
    pub ppm15_probability: f64,
    pub severe_delay_probability: f64,
    pub confidence: Confidence,
    pub sample_size: i64,
    pub level: LadderLevel,
    pub is_degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
    pub time_adjustment_factor: f64,
    pub day_adjustment_factor: f64,
    pub explanation: String,
}

/// Base figures pulled from whichever statistics table answered.
struct BaseStats {
    level: LadderLevel,
    /// Probabilities in [0,1]: within 5 / within 15 / within 30 minutes.
    p5: f64,
    p15: f64,
    p30: f64,
    avg_delay: f64,
    sample: i64,
}

/// Scale factor for the expected delay by departure hour.
pub fn time_adjustment_factor(hour: u32) -> f64 {
    match hour {
        0..=5 => 0.85,
        6..=9 => 1.15,
        10..=15 => 1.00,
        16..=18 => 1.20,
        _ => 1.05,
    }
}

/// Weekends run quieter timetables and perform better.
pub fn day_adjustment_factor(weekday: chrono::Weekday) -> f64 {
    match weekday {
        chrono::Weekday::Sat | chrono::Weekday::Sun => 0.90,
        _ => 1.00,
    }
}

/// The probability adjustment inverts the delay factor: a worse slot
/// (factor > 1) lowers the chance of running to time.
fn adjust_probability(p: f64, factor: f64) -> f64 {
    (p * (2.0 - factor)).clamp(0.0, 1.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn confidence_for(level: LadderLevel, sample: i64) -> Confidence {
    if level == LadderLevel::IndustryFloor {
        return Confidence::VeryLow;
    }
    if level.rank() <= 2 && sample >= 150 {
        Confidence::High
    } else if sample >= 50 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

pub async fn predict(
    store: &Store,
    origin: &str,
    destination: &str,
    departure: NaiveDateTime,
    operator_hint: Option<&str>,
) -> Result<Prediction, StoreError> {
    let (base, degradation_reason) =
        match consult_ladder(store, origin, destination, operator_hint).await? {
            Some(base) => (base, None),
            None => (
                BaseStats {
                    level: LadderLevel::IndustryFloor,
                    p5: FLOOR_ON_TIME,
                    p15: 0.80,
                    p30: 0.95,
                    avg_delay: FLOOR_AVG_DELAY,
                    sample: 0,
                },
                Some("no_route_data".to_string()),
            ),
        };

    let time_factor = time_adjustment_factor(departure.time().hour());
    let day_factor = day_adjustment_factor(departure.date().weekday());
    let combined = time_factor * day_factor;

    let on_time = adjust_probability(base.p5, combined);
    let p15 = adjust_probability(base.p15, combined);
    let p30 = adjust_probability(base.p30, combined);
    let expected_delay = round1(base.avg_delay * combined);
    let is_degraded = base.level == LadderLevel::IndustryFloor;
    let confidence = confidence_for(base.level, base.sample);

    let explanation = build_explanation(
        origin,
        destination,
        base.level,
        base.sample,
        on_time,
        expected_delay,
        degradation_reason.as_deref(),
    );

    Ok(Prediction {
        expected_delay_minutes: expected_delay,
        on_time_probability: on_time,
        ppm5_probability: on_time,
        ppm15_probability: p15,
        severe_delay_probability: (1.0 - p30).clamp(0.0, 1.0),
        confidence,
        sample_size: base.sample,
        level: base.level,
        is_degraded,
        degradation_reason,
        time_adjustment_factor: time_factor,
        day_adjustment_factor: day_factor,
        explanation,
    })
}

/// Walk the ladder top-down, returning the first level with enough data.
async fn consult_ladder(
    store: &Store,
    origin: &str,
    destination: &str,
    operator_hint: Option<&str>,
) -> Result<Option<BaseStats>, StoreError> {
    let route_stat = store.latest_route_stat(origin, destination).await?;

    // Level 1: route statistics confirmed for the requested operator.
    if let (Some(route), Some(hint)) = (&route_stat, operator_hint) {
        if route.total_services >= MIN_SAMPLE_SIZE
            && store.latest_toc_stat(hint).await?.is_some()
        {
            return Ok(Some(BaseStats {
                level: LadderLevel::RouteOperator,
                p5: route.time_to_5_percentage / 100.0,
                p15: route.time_to_15_percentage / 100.0,
                p30: route.time_to_30_percentage / 100.0,
                avg_delay: route.avg_delay_minutes,
                sample: route.total_services,
            }));
        }
    }

    // Level 2: route statistics alone.
    if let Some(route) = &route_stat {
        if route.total_services >= MIN_SAMPLE_SIZE {
            return Ok(Some(BaseStats {
                level: LadderLevel::Route,
                p5: route.time_to_5_percentage / 100.0,
                p15: route.time_to_15_percentage / 100.0,
                p30: route.time_to_30_percentage / 100.0,
                avg_delay: route.avg_delay_minutes,
                sample: route.total_services,
            }));
        }
    }

    // Level 3: the operator across its network.
    if let Some(hint) = operator_hint {
        if let Some(toc) = store.latest_toc_stat(hint).await? {
            if toc.total_services >= MIN_SAMPLE_SIZE {
                return Ok(Some(BaseStats {
                    level: LadderLevel::OperatorNetwork,
                    p5: toc.ppm_5_percentage / 100.0,
                    p15: toc.ppm_15_percentage / 100.0,
                    p30: toc.ppm_30_percentage / 100.0,
                    avg_delay: toc.avg_delay_minutes,
                    sample: toc.total_services,
                }));
            }
        }
    }

    // Level 4: the whole network.
    if let Some(network) = store.network_average().await? {
        if network.sample_size >= MIN_SAMPLE_SIZE {
            return Ok(Some(BaseStats {
                level: LadderLevel::NetworkAverage,
                p5: network.time_to_5_percentage / 100.0,
                p15: network.time_to_15_percentage / 100.0,
                p30: network.time_to_30_percentage / 100.0,
                avg_delay: network.avg_delay_minutes,
                sample: network.sample_size,
            }));
        }
    }

    Ok(None)
}

fn build_explanation(
    origin: &str,
    destination: &str,
    level: LadderLevel,
    sample: i64,
    on_time: f64,
    expected_delay: f64,
    degradation_reason: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if sample > 0 {
        parts.push(format!(
            "Based on {sample} recorded arrivals for {origin}-{destination} ({}).",
            level.describe()
        ));
    } else {
        parts.push(format!(
            "No usable history for {origin}-{destination}; using the {}.",
            level.describe()
        ));
    }
    parts.push(format!(
        "Estimated {:.0}% chance of arriving within 5 minutes, expected delay {expected_delay:.1} minutes.",
        on_time * 100.0
    ));
    if let Some(reason) = degradation_reason {
        parts.push(format!("Degraded: {reason}."));
    }
    parts.join(" ")
}
