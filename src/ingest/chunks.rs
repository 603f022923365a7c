//! Deterministic decomposition of a phase into fetch tasks.
//!
//! The upstream serviceMetrics endpoint degrades on wide date ranges, so a
//! range is split into contiguous chunks of at most 7 calendar days. Chunk
//! boundaries depend only on the inputs, which is what makes resume-by-task
//! possible.

use chrono::{Days, NaiveDate};

use crate::config::{DayType, PhaseConfig, RouteConfig};

pub const MAX_CHUNK_DAYS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateChunk {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Split `[from, to]` into contiguous chunks covering the range exactly,
/// each spanning at most [`MAX_CHUNK_DAYS`] calendar days.
pub fn split_date_range(from: NaiveDate, to: NaiveDate) -> Vec<DateChunk> {
    let mut chunks = Vec::new();
    let mut current = from;
    while current <= to {
        let candidate = current + Days::new(MAX_CHUNK_DAYS - 1);
        let end = candidate.min(to);
        chunks.push(DateChunk {
            start: current,
            end,
        });
        current = end + Days::new(1);
    }
    chunks
}

/// One unit of ingestion work: a route, a day type, a date chunk.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub route: RouteConfig,
    pub day_type: DayType,
    pub chunk: DateChunk,
}

impl FetchTask {
    /// Stable key used by the progress journal's completed-task set.
    pub fn key(&self) -> String {
        format!(
            "{}-{}|{}|{}|{}",
            self.route.origin, self.route.destination, self.day_type, self.chunk.start,
            self.chunk.end
        )
    }
}

/// Expand a phase into its full task sequence, ordered lexicographically by
/// (route, day_type, chunk_start). The order is observable: tests and
/// resumed runs both rely on it.
pub fn expand_tasks(config: &PhaseConfig) -> Vec<FetchTask> {
    let chunks = split_date_range(config.from_date, config.to_date);

    let mut routes: Vec<&RouteConfig> = config.routes.iter().collect();
    routes.sort_by(|a, b| {
        (&a.origin, &a.destination).cmp(&(&b.origin, &b.destination))
    });
    let mut day_types = config.day_types.clone();
    day_types.sort();
    day_types.dedup();

    let mut tasks = Vec::with_capacity(routes.len() * day_types.len() * chunks.len());
    for route in routes {
        for &day_type in &day_types {
            for &chunk in &chunks {
                tasks.push(FetchTask {
                    route: route.clone(),
                    day_type,
                    chunk,
                });
            }
        }
    }
    tasks
}
