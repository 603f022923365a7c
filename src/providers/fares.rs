//! Fare feed client and archive decoder.
//!
//! The upstream feed is a zip archive refreshed at most once every 24 hours.
//! A local copy is kept on disk next to a small metadata file recording the
//! Last-Modified header, so an unchanged archive costs one conditional GET.
//! The archive layout is hidden behind [`FareDecoder`]; the bundled decoder
//! reads the fixed-width flow file carried in the zip.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{Credentials, FaresConfig};

/// Fares above £1000 (or non-positive) are feed artefacts, not prices.
pub const MAX_VALID_FARE_PENCE: i64 = 100_000;
/// The feed uses this sentinel for "no fare available".
const NO_FARE_SENTINEL: i64 = 99_999_999;

#[derive(Debug, Error)]
pub enum FareError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Network error: {0}")]
    NetworkMessage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Fare archive parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Advance,
    OffPeak,
    Anytime,
    SuperOffPeak,
    Season,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketType::Advance => "advance",
            TicketType::OffPeak => "off_peak",
            TicketType::Anytime => "anytime",
            TicketType::SuperOffPeak => "super_off_peak",
            TicketType::Season => "season",
        }
    }

    /// Map a 3-char feed ticket code. The authoritative mapping lives in the
    /// feed's ticket-types file; this covers the code families in practice.
    pub fn from_ticket_code(code: &str) -> Self {
        let code = code.to_ascii_uppercase();
        if code.contains("ADV") || code.contains("AP") {
            TicketType::Advance
        } else if code.starts_with('7') || code.contains("SSN") {
            TicketType::Season
        } else if code.contains("SOP") || code.contains("SSR") {
            TicketType::SuperOffPeak
        } else if code.contains("OFF") || code.contains("OP") {
            TicketType::OffPeak
        } else {
            TicketType::Anytime
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketClass {
    Standard,
    First,
}

impl TicketClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketClass::Standard => "standard",
            TicketClass::First => "first",
        }
    }
}

/// One decoded fare offer, prices in pence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareRecord {
    pub origin: String,
    pub destination: String,
    pub ticket_type: TicketType,
    pub ticket_class: TicketClass,
    pub adult_pence: i64,
    pub child_pence: Option<i64>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub route_restriction: Option<String>,
    pub toc_code: Option<String>,
    pub data_source: String,
}

impl FareRecord {
    /// Admissibility window applied at ingest; anything outside is dropped.
    pub fn is_admissible(&self) -> bool {
        self.adult_pence >= 1
            && self.adult_pence <= MAX_VALID_FARE_PENCE
            && self.adult_pence != NO_FARE_SENTINEL
    }
}

/// Converts a downloaded archive into fare records. The archive's internal
/// layout is this trait's private business.
pub trait FareDecoder: Send + Sync {
    fn decode(&self, archive: &Path) -> Result<Vec<FareRecord>, FareError>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ArchiveMetadata {
    last_modified: Option<String>,
    downloaded_at: Option<DateTime<Utc>>,
}

pub struct FaresClient {
    http: reqwest::Client,
    config: FaresConfig,
    credentials: Credentials,
}

impl FaresClient {
    pub fn new(config: FaresConfig, credentials: Credentials) -> Result<Self, FareError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            http,
            config,
            credentials,
        })
    }

    fn archive_path(&self) -> PathBuf {
        Path::new(&self.config.cache_dir).join("fares.zip")
    }

    fn metadata_path(&self) -> PathBuf {
        Path::new(&self.config.cache_dir).join("metadata.json")
    }

    /// Return the archive path, downloading only when the local copy is
    /// absent or older than the refresh window.
    pub async fn ensure_fresh(&self) -> Result<PathBuf, FareError> {
        let archive = self.archive_path();
        if let Some(downloaded_at) = self.local_download_time(&archive).await {
            if !archive_is_stale(downloaded_at, Utc::now(), self.config.refresh_hours) {
                debug!("Fare archive still fresh");
                return Ok(archive);
            }
        }
        self.download().await
    }

    async fn local_download_time(&self, archive: &Path) -> Option<DateTime<Utc>> {
        if tokio::fs::metadata(archive).await.is_err() {
            return None;
        }
        let content = tokio::fs::read_to_string(self.metadata_path()).await.ok()?;
        let meta: ArchiveMetadata = serde_json::from_str(&content).ok()?;
        meta.downloaded_at
    }

    async fn download(&self) -> Result<PathBuf, FareError> {
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let archive = self.archive_path();
        let token = self.authenticate().await?;

        let mut request = self
            .http
            .get(&self.config.feed_url)
            .bearer_auth(&token);
        if let Ok(content) = tokio::fs::read_to_string(self.metadata_path()).await {
            if let Ok(meta) = serde_json::from_str::<ArchiveMetadata>(&content) {
                if let Some(last_modified) = meta.last_modified {
                    request = request.header("If-Modified-Since", last_modified);
                }
            }
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            info!("Fare archive not modified upstream, reusing cached copy");
            self.write_metadata(None).await?;
            return Ok(archive);
        }
        if !response.status().is_success() {
            return Err(FareError::NetworkMessage(format!(
                "fare feed HTTP {}",
                response.status()
            )));
        }

        let last_modified = response
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Stream to a temp file, then rename: a cut connection never leaves
        // a truncated archive behind.
        let tmp = archive.with_extension("zip.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut total_bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &archive).await?;
        info!(size_mb = total_bytes / (1024 * 1024), "Downloaded fare archive");

        self.write_metadata(last_modified).await?;
        Ok(archive)
    }

    async fn write_metadata(&self, last_modified: Option<String>) -> Result<(), FareError> {
        // On 304 the previous Last-Modified still holds; only refresh the clock.
        let previous = match tokio::fs::read_to_string(self.metadata_path()).await {
            Ok(content) => serde_json::from_str::<ArchiveMetadata>(&content).unwrap_or_default(),
            Err(_) => ArchiveMetadata::default(),
        };
        let meta = ArchiveMetadata {
            last_modified: last_modified.or(previous.last_modified),
            downloaded_at: Some(Utc::now()),
        };
        let body = serde_json::to_string(&meta)
            .map_err(|e| FareError::Parse(format!("metadata serialize: {e}")))?;
        tokio::fs::write(self.metadata_path(), body).await?;
        Ok(())
    }

    async fn authenticate(&self) -> Result<String, FareError> {
        #[derive(Serialize)]
        struct AuthBody<'a> {
            username: &'a str,
            password: &'a str,
        }
        #[derive(Deserialize)]
        struct AuthReply {
            token: String,
        }
        let response = self
            .http
            .post(&self.config.auth_url)
            .json(&AuthBody {
                username: &self.credentials.email,
                password: &self.credentials.password,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FareError::NetworkMessage(format!(
                "fare feed auth HTTP {}",
                response.status()
            )));
        }
        let reply: AuthReply = response
            .json()
            .await
            .map_err(|e| FareError::Parse(e.to_string()))?;
        Ok(reply.token)
    }
}

/// Decoder for the fixed-width flow file inside the feed zip.
///
/// Two record kinds matter: `F` (flow: origin/destination/route/validity)
/// and `T` (fare: ticket code and price, joined to its flow by flow id).
/// Records whose update marker is `D` are deletions and skipped. When the
/// archive carries a locations file, its NLC-to-CRS mapping rewrites the
/// flow endpoints into the 3-letter codes the rest of the system speaks.
pub struct FlowFileDecoder;

impl FareDecoder for FlowFileDecoder {
    fn decode(&self, archive: &Path) -> Result<Vec<FareRecord>, FareError> {
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)?;

        let names: Vec<String> = (0..zip.len())
            .filter_map(|i| zip.by_index(i).ok().map(|e| e.name().to_string()))
            .collect();
        let flow_name = names
            .iter()
            .find(|name| name.to_ascii_uppercase().ends_with("FFL"))
            .ok_or_else(|| FareError::Parse("no flow file in archive".into()))?
            .clone();

        let mut nlc_to_crs = std::collections::HashMap::new();
        if let Some(loc_name) = names
            .iter()
            .find(|name| name.to_ascii_uppercase().ends_with(".LOC"))
        {
            let mut content = String::new();
            zip.by_name(loc_name)?.read_to_string(&mut content)?;
            nlc_to_crs = parse_locations_file(&content);
        }

        let mut content = String::new();
        zip.by_name(&flow_name)?.read_to_string(&mut content)?;
        let mut fares = parse_flow_file(&content);
        for fare in &mut fares {
            if let Some(crs) = nlc_to_crs.get(&fare.origin) {
                fare.origin = crs.clone();
            }
            if let Some(crs) = nlc_to_crs.get(&fare.destination) {
                fare.destination = crs.clone();
            }
        }
        Ok(fares)
    }
}

/// NLC (4 digits, position 37-40) to CRS (3 letters, position 57-59) from
/// the locations file's `L` records.
fn parse_locations_file(content: &str) -> std::collections::HashMap<String, String> {
    let mut mapping = std::collections::HashMap::new();
    for line in content.lines() {
        if line.len() < 59 || !line.is_ascii() || line.starts_with("/!!") || &line[0..1] == "D" {
            continue;
        }
        if &line[1..2] != "L" {
            continue;
        }
        let nlc = line[36..40].trim();
        let crs = line[56..59].trim();
        if nlc.len() == 4 && crs.len() == 3 {
            mapping.insert(nlc.to_string(), crs.to_ascii_uppercase());
        }
    }
    mapping
}

struct Flow {
    origin: String,
    destination: String,
    route_code: String,
    toc_code: Option<String>,
    valid_from: Option<NaiveDate>,
    valid_until: Option<NaiveDate>,
}

fn parse_flow_file(content: &str) -> Vec<FareRecord> {
    use std::collections::HashMap;

    let mut flows: HashMap<String, Flow> = HashMap::new();
    let mut fares = Vec::new();

    for line in content.lines() {
        if line.len() < 2 || !line.is_ascii() || line.starts_with("/!!") {
            continue;
        }
        let update_marker = &line[0..1];
        if update_marker == "D" {
            continue;
        }
        match &line[1..2] {
            "F" if line.len() >= 49 => {
                let status_code = line[15..18].trim();
                let flow_id = line[42..49].trim();
                // Status 000 marks the adult-fare flow; others are discounts.
                if status_code == "000" && !flow_id.is_empty() {
                    let toc = line[36..39].trim();
                    flows.insert(
                        flow_id.to_string(),
                        Flow {
                            origin: line[2..6].trim().to_string(),
                            destination: line[6..10].trim().to_string(),
                            route_code: line[10..15].trim().to_string(),
                            toc_code: (!toc.is_empty()).then(|| toc.to_string()),
                            valid_from: parse_feed_date(line[28..36].trim()),
                            valid_until: parse_feed_date(line[20..28].trim()),
                        },
                    );
                }
            }
            "T" if line.len() >= 22 => {
                let flow_id = line[2..9].trim();
                let ticket_code = line[9..12].trim();
                let fare_str = line[12..20].trim();
                let restriction = line[20..22].trim();
                let Some(flow) = flows.get(flow_id) else {
                    continue;
                };
                let Ok(pence) = fare_str.parse::<i64>() else {
                    continue;
                };
                let record = FareRecord {
                    origin: flow.origin.clone(),
                    destination: flow.destination.clone(),
                    ticket_type: TicketType::from_ticket_code(ticket_code),
                    ticket_class: TicketClass::Standard,
                    adult_pence: pence,
                    child_pence: None,
                    valid_from: flow.valid_from,
                    valid_until: flow.valid_until,
                    route_restriction: (!restriction.is_empty() && restriction != "00")
                        .then(|| restriction.to_string()),
                    toc_code: flow.toc_code.clone(),
                    data_source: "NRDP_REAL".to_string(),
                };
                if record.is_admissible() {
                    fares.push(record);
                } else {
                    debug!(pence, "Dropping inadmissible fare");
                }
            }
            _ => {}
        }
    }

    if fares.is_empty() {
        warn!("Flow file yielded no admissible fares");
    }
    fares
}

/// A local archive older than the refresh window must be re-downloaded;
/// anything younger is reused as-is.
pub fn archive_is_stale(
    downloaded_at: DateTime<Utc>,
    now: DateTime<Utc>,
    refresh_hours: u64,
) -> bool {
    now - downloaded_at >= chrono::Duration::hours(refresh_hours as i64)
}

/// Feed dates are ddmmyyyy; 31122999 means open-ended.
fn parse_feed_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || s == "31122999" {
        return None;
    }
    let day = s[0..2].parse().ok()?;
    let month = s[2..4].parse().ok()?;
    let year = s[4..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_line(flow_id: &str, origin: &str, dest: &str) -> String {
        let mut line = String::from("RF");
        line.push_str(&format!("{origin:<4}"));
        line.push_str(&format!("{dest:<4}"));
        line.push_str("00000"); // route code
        line.push_str("000"); // status: adult fare
        line.push_str("  "); // filler
        line.push_str("01122025"); // end date
        line.push_str("01012024"); // start date
        line.push_str("VT "); // toc
        line.push_str("   "); // filler
        line.push_str(&format!("{flow_id:<7}"));
        line
    }

    fn fare_line(flow_id: &str, ticket: &str, pence: i64) -> String {
        format!("RT{flow_id:<7}{ticket:<3}{pence:0>8}00")
    }

    #[test]
    fn parses_flow_and_fare_records() {
        let content = format!(
            "{}\n{}\n{}",
            flow_line("0000001", "1444", "2968"),
            fare_line("0000001", "SDS", 2550),
            fare_line("0000001", "SOP", 1800),
        );
        let fares = parse_flow_file(&content);
        assert_eq!(fares.len(), 2);
        assert_eq!(fares[0].origin, "1444");
        assert_eq!(fares[0].adult_pence, 2550);
        assert_eq!(fares[1].ticket_type, TicketType::SuperOffPeak);
    }

    #[test]
    fn drops_deleted_and_orphan_records() {
        let content = format!(
            "D{}\n{}",
            &flow_line("0000002", "1444", "2968")[1..],
            fare_line("0000002", "SDS", 2550),
        );
        // The flow was deleted, so its fare has nothing to join to.
        assert!(parse_flow_file(&content).is_empty());
    }

    #[test]
    fn admissibility_window() {
        let mut record = FareRecord {
            origin: "1444".into(),
            destination: "2968".into(),
            ticket_type: TicketType::Anytime,
            ticket_class: TicketClass::Standard,
            adult_pence: 2550,
            child_pence: None,
            valid_from: None,
            valid_until: None,
            route_restriction: None,
            toc_code: None,
            data_source: "NRDP_REAL".into(),
        };
        assert!(record.is_admissible());
        record.adult_pence = 0;
        assert!(!record.is_admissible());
        record.adult_pence = 100_001;
        assert!(!record.is_admissible());
        record.adult_pence = 100_000;
        assert!(record.is_admissible());
    }

    #[test]
    fn sentinel_fare_is_dropped_at_parse() {
        let content = format!(
            "{}\n{}",
            flow_line("0000003", "1444", "2968"),
            fare_line("0000003", "SDS", 99_999_999),
        );
        assert!(parse_flow_file(&content).is_empty());
    }

    #[test]
    fn ticket_code_families() {
        assert_eq!(TicketType::from_ticket_code("SAP"), TicketType::Advance);
        assert_eq!(TicketType::from_ticket_code("SOP"), TicketType::SuperOffPeak);
        assert_eq!(TicketType::from_ticket_code("OFF"), TicketType::OffPeak);
        assert_eq!(TicketType::from_ticket_code("SDS"), TicketType::Anytime);
        assert_eq!(TicketType::from_ticket_code("7DS"), TicketType::Season);
    }

    #[test]
    fn freshness_window_is_24_hours() {
        let now = Utc::now();
        let h23 = now - chrono::Duration::hours(23);
        let h25 = now - chrono::Duration::hours(25);
        assert!(!archive_is_stale(h23, now, 24));
        assert!(archive_is_stale(h25, now, 24));
        assert!(archive_is_stale(now - chrono::Duration::hours(24), now, 24));
    }

    #[test]
    fn locations_file_maps_nlc_to_crs() {
        let mut line = String::from("RL");
        line.push_str(&" ".repeat(34)); // through position 36
        line.push_str("1444"); // NLC
        line.push_str(&" ".repeat(16)); // through position 56
        line.push_str("EUS");
        let mapping = parse_locations_file(&line);
        assert_eq!(mapping.get("1444").map(String::as_str), Some("EUS"));
    }

    #[test]
    fn feed_date_parsing() {
        assert_eq!(
            parse_feed_date("01122024"),
            NaiveDate::from_ymd_opt(2024, 12, 1)
        );
        assert_eq!(parse_feed_date("31122999"), None);
        assert_eq!(parse_feed_date("notadate"), None);
    }
}
