//! Fare lookup and comparison for the serving layer.
//!
//! Reads the fare rows the ingester maintains and condenses them into the
//! comparison shape the predict endpoint returns. When a feed client is
//! configured, a stale archive is refreshed inline before answering, which
//! keeps the 24-hour freshness contract without a separate scheduler.

use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::providers::fares::{FareDecoder, FareError, FaresClient};
use crate::store::{FareRow, Store};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FareView {
    pub ticket_type: String,
    pub ticket_class: String,
    /// Price in pounds.
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_restriction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toc_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FareComparison {
    pub fares: Vec<FareView>,
    pub cheapest_type: Option<String>,
    pub cheapest_price: Option<f64>,
    /// Savings versus the most expensive admissible fare, pounds.
    pub savings_amount: Option<f64>,
    pub savings_percentage: Option<f64>,
    pub data_source: String,
    pub last_updated: Option<String>,
}

fn pence_to_pounds(pence: i64) -> f64 {
    pence as f64 / 100.0
}

/// Collapse fare rows into the comparison summary. Returns None when the
/// route has no admissible fares at all.
pub fn build_comparison(rows: &[FareRow]) -> Option<FareComparison> {
    if rows.is_empty() {
        return None;
    }

    // Cheapest row per ticket type, standard class preferred.
    let mut by_type: Vec<&FareRow> = Vec::new();
    for row in rows {
        match by_type
            .iter_mut()
            .find(|r| r.ticket_type == row.ticket_type)
        {
            Some(existing) => {
                if row.adult_pence < existing.adult_pence {
                    *existing = row;
                }
            }
            None => by_type.push(row),
        }
    }
    by_type.sort_by_key(|r| r.adult_pence);

    let cheapest = by_type.first()?;
    let most_expensive = by_type.last()?;
    let savings_pence = most_expensive.adult_pence - cheapest.adult_pence;
    let savings_percentage = if most_expensive.adult_pence > 0 && savings_pence > 0 {
        Some((savings_pence as f64 / most_expensive.adult_pence as f64) * 100.0)
    } else {
        None
    };

    let data_source = if rows.iter().any(|r| r.data_source == "NRDP_REAL") {
        "NRDP_REAL".to_string()
    } else {
        rows[0].data_source.clone()
    };
    let last_updated = rows.iter().map(|r| r.cached_at.clone()).max();

    Some(FareComparison {
        cheapest_type: Some(cheapest.ticket_type.clone()),
        cheapest_price: Some(pence_to_pounds(cheapest.adult_pence)),
        savings_amount: (savings_pence > 0).then(|| pence_to_pounds(savings_pence)),
        savings_percentage,
        data_source,
        last_updated,
        fares: by_type
            .into_iter()
            .map(|r| FareView {
                ticket_type: r.ticket_type.clone(),
                ticket_class: r.ticket_class.clone(),
                price: pence_to_pounds(r.adult_pence),
                route_restriction: r.route_restriction.clone(),
                toc_code: r.toc_code.clone(),
            })
            .collect(),
    })
}

/// Serving-side fare access: optional inline refresh plus the read path.
pub struct FareService {
    store: Store,
    feed: Option<(FaresClient, Box<dyn FareDecoder>)>,
}

impl FareService {
    pub fn new(store: Store, feed: Option<(FaresClient, Box<dyn FareDecoder>)>) -> Self {
        Self { store, feed }
    }

    pub fn read_only(store: Store) -> Self {
        Self { store, feed: None }
    }

    /// Refresh the archive when stale, then build the route's comparison.
    /// Feed trouble degrades to whatever the store already holds.
    pub async fn comparison(&self, origin: &str, destination: &str) -> Option<FareComparison> {
        if let Err(e) = self.refresh_if_stale().await {
            warn!(error = %e, "Fare refresh failed, serving stored fares");
        }
        match self.store.fares_for_route(origin, destination).await {
            Ok(rows) => build_comparison(&rows),
            Err(e) => {
                warn!(origin, destination, error = %e, "Fare lookup failed");
                None
            }
        }
    }

    async fn refresh_if_stale(&self) -> Result<(), FareError> {
        let Some((client, decoder)) = &self.feed else {
            return Ok(());
        };
        let archive = client.ensure_fresh().await?;
        // ensure_fresh is a no-op on a fresh archive; decode only follows a
        // real download or an aged-out copy.
        let records = decoder.decode(&archive)?;
        let admissible: Vec<_> = records.into_iter().filter(|r| r.is_admissible()).collect();
        if !admissible.is_empty() {
            if let Err(e) = self.store.upsert_fares(&admissible).await {
                warn!(error = %e, "Fare upsert failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticket_type: &str, pence: i64, source: &str) -> FareRow {
        FareRow {
            ticket_type: ticket_type.into(),
            ticket_class: "standard".into(),
            adult_pence: pence,
            child_pence: None,
            route_restriction: None,
            toc_code: Some("VT".into()),
            data_source: source.into(),
            cached_at: "2025-01-15T09:00:00+00:00".into(),
        }
    }

    #[test]
    fn comparison_picks_cheapest_and_savings() {
        let rows = vec![
            row("anytime", 8900, "NRDP_REAL"),
            row("advance", 2550, "NRDP_REAL"),
            row("off_peak", 4500, "NRDP_REAL"),
        ];
        let cmp = build_comparison(&rows).unwrap();
        assert_eq!(cmp.cheapest_type.as_deref(), Some("advance"));
        assert_eq!(cmp.cheapest_price, Some(25.50));
        assert_eq!(cmp.savings_amount, Some(63.50));
        let pct = cmp.savings_percentage.unwrap();
        assert!((pct - 71.34831460674157).abs() < 1e-9);
        assert_eq!(cmp.fares.len(), 3);
        assert_eq!(cmp.fares[0].ticket_type, "advance");
    }

    #[test]
    fn duplicate_ticket_types_keep_the_cheapest() {
        let rows = vec![
            row("advance", 3000, "NRDP_REAL"),
            row("advance", 2550, "NRDP_REAL"),
        ];
        let cmp = build_comparison(&rows).unwrap();
        assert_eq!(cmp.fares.len(), 1);
        assert_eq!(cmp.cheapest_price, Some(25.50));
        // A single fare has nothing to save against.
        assert_eq!(cmp.savings_amount, None);
    }

    #[test]
    fn empty_rows_give_no_comparison() {
        assert!(build_comparison(&[]).is_none());
    }

    #[test]
    fn real_source_wins_the_label() {
        let rows = vec![
            row("advance", 2550, "SIMULATED"),
            row("anytime", 8900, "NRDP_REAL"),
        ];
        let cmp = build_comparison(&rows).unwrap();
        assert_eq!(cmp.data_source, "NRDP_REAL");
    }
}
