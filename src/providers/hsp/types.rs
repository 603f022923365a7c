//! Wire types for the HSP serviceMetrics / serviceDetails endpoints.
//!
//! Field names follow the upstream JSON exactly; numeric fields arrive as
//! strings and are parsed downstream. Times are HHMM strings in UK civil
//! time against the service date.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsQuery {
    pub from_loc: String,
    pub to_loc: String,
    pub from_date: String,
    pub to_date: String,
    pub from_time: String,
    pub to_time: String,
    pub days: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailsQuery {
    pub rid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMetricsResponse {
    #[serde(default)]
    pub header: MetricsHeader,
    #[serde(rename = "Services", default)]
    pub services: Vec<ServiceMetric>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsHeader {
    #[serde(default)]
    pub from_location: Option<String>,
    #[serde(default)]
    pub to_location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMetric {
    #[serde(rename = "serviceAttributesMetrics")]
    pub attributes: ServiceAttributesMetrics,
    #[serde(rename = "Metrics", default)]
    pub metrics: Vec<ToleranceMetric>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAttributesMetrics {
    pub origin_location: Option<String>,
    pub destination_location: Option<String>,
    /// Public timetable departure, HHMM.
    pub gbtt_ptd: Option<String>,
    /// Public timetable arrival, HHMM.
    pub gbtt_pta: Option<String>,
    pub toc_code: Option<String>,
    pub matched_services: Option<String>,
    #[serde(default)]
    pub rids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToleranceMetric {
    pub tolerance_value: Option<String>,
    pub num_tolerance: Option<String>,
    pub num_not_tolerance: Option<String>,
    pub percent_tolerance: Option<String>,
    #[serde(default)]
    pub global_tolerance: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDetailsResponse {
    #[serde(rename = "serviceAttributesDetails")]
    pub attributes: ServiceAttributesDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAttributesDetails {
    pub rid: Option<String>,
    pub date_of_service: Option<String>,
    pub toc_code: Option<String>,
    #[serde(default)]
    pub locations: Vec<LocationDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationDetail {
    pub location: Option<String>,
    #[serde(default)]
    pub gbtt_ptd: Option<String>,
    #[serde(default)]
    pub gbtt_pta: Option<String>,
    #[serde(default)]
    pub actual_td: Option<String>,
    #[serde(default)]
    pub actual_ta: Option<String>,
    #[serde(default)]
    pub late_canc_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_response_parses_upstream_shape() {
        let json = r#"{
            "header": {"from_location": "EUS", "to_location": "MAN"},
            "Services": [{
                "serviceAttributesMetrics": {
                    "origin_location": "EUS",
                    "destination_location": "MAN",
                    "gbtt_ptd": "0712",
                    "gbtt_pta": "0920",
                    "toc_code": "VT",
                    "matched_services": "22",
                    "rids": ["202412150001"]
                },
                "Metrics": [{
                    "tolerance_value": "5",
                    "num_tolerance": "18",
                    "num_not_tolerance": "4",
                    "percent_tolerance": "81.8",
                    "global_tolerance": true
                }]
            }]
        }"#;
        let parsed: ServiceMetricsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.header.from_location.as_deref(), Some("EUS"));
        assert_eq!(parsed.services.len(), 1);
        let attrs = &parsed.services[0].attributes;
        assert_eq!(attrs.gbtt_ptd.as_deref(), Some("0712"));
        assert_eq!(attrs.rids, vec!["202412150001"]);
    }

    #[test]
    fn details_response_tolerates_missing_actuals() {
        let json = r#"{
            "serviceAttributesDetails": {
                "rid": "202412150001",
                "date_of_service": "2024-12-15",
                "toc_code": "VT",
                "locations": [
                    {"location": "EUS", "gbtt_ptd": "0712", "actual_td": "0714"},
                    {"location": "MAN", "gbtt_pta": "0920"}
                ]
            }
        }"#;
        let parsed: ServiceDetailsResponse = serde_json::from_str(json).unwrap();
        let locs = &parsed.attributes.locations;
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[1].actual_ta, None);
    }
}
