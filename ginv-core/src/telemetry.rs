//! Exporter telemetry parsing and indexing
//!
//! Parses the telemetry exporter's text exposition into per-GPU points and
//! indexes them by device UUID and by device index. A point found under both
//! keys is merged with the UUID entry taking precedence field by field.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Heartbeat metric: wall-clock timestamp of the exporter's last refresh.
pub const EXPORTER_HEARTBEAT_METRIC: &str = "dcgm_exporter_last_update_time_seconds";

pub const METRIC_GPU_TEMP: &str = "DCGM_FI_DEV_GPU_TEMP";
pub const METRIC_ECC_DBE_TOTAL: &str = "DCGM_FI_DEV_ECC_DBE_AGG_TOTAL";
pub const METRIC_XID_ERRORS: &str = "DCGM_FI_DEV_XID_ERRORS";
pub const METRIC_POWER_VIOLATION: &str = "DCGM_FI_DEV_POWER_VIOLATION";
pub const METRIC_THERMAL_VIOLATION: &str = "DCGM_FI_DEV_THERMAL_VIOLATION";
pub const METRIC_RELIABILITY_VIOLATION: &str = "DCGM_FI_DEV_RELIABILITY_VIOLATION";

/// Correlation label carrying the device UUID.
pub const LABEL_UUID: &str = "uuid";
/// Correlation label carrying the device index.
pub const LABEL_GPU: &str = "gpu";

/// One parsed metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Parse one text-exposition line into (name, labels, value).
///
/// Returns `None` for blank lines, comments, lines without a parseable finite
/// value, and lines with no value token at all. A `{` without a matching `}`
/// in the name token is kept as part of the name and yields no labels.
pub fn parse_metric_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() < 2 {
        // No value token present.
        return None;
    }
    let first = tokens[0];

    let value: f64 = tokens[tokens.len() - 1].parse().ok()?;
    if value.is_nan() || value.is_infinite() {
        return None;
    }

    let (name, labels) = match (first.find('{'), first.rfind('}')) {
        (Some(open), Some(close)) if close > open => {
            (first[..open].to_string(), parse_label_block(&first[open + 1..close]))
        }
        _ => (first.to_string(), HashMap::new()),
    };

    Some(ParsedLine { name, labels, value })
}

/// Parse the `k="v",...` interior of a label block. Items without `=` are
/// skipped.
fn parse_label_block(block: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for item in block.split(',') {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"');
        labels.insert(key.to_string(), value.to_string());
    }
    labels
}

/// Telemetry sample for one GPU within one reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryPoint {
    pub temperature_c: Option<i32>,
    pub ecc_total: Option<i64>,
    pub xid_code: Option<i64>,
    pub power_violations: Option<i64>,
    pub thermal_violations: Option<i64>,
    pub reliability_violations: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TelemetryPoint {
    fn is_empty(&self) -> bool {
        *self == TelemetryPoint::default()
    }

    /// Field-wise overwrite from `other`; `last_updated` becomes the max.
    fn merge_from(&mut self, other: &TelemetryPoint) {
        if other.temperature_c.is_some() {
            self.temperature_c = other.temperature_c;
        }
        if other.ecc_total.is_some() {
            self.ecc_total = other.ecc_total;
        }
        if other.xid_code.is_some() {
            self.xid_code = other.xid_code;
        }
        if other.power_violations.is_some() {
            self.power_violations = other.power_violations;
        }
        if other.thermal_violations.is_some() {
            self.thermal_violations = other.thermal_violations;
        }
        if other.reliability_violations.is_some() {
            self.reliability_violations = other.reliability_violations;
        }
        self.last_updated = max_ts(self.last_updated, other.last_updated);
    }

    /// Fill only fields this point does not carry from `other`.
    fn fill_missing_from(&mut self, other: &TelemetryPoint) {
        if self.temperature_c.is_none() {
            self.temperature_c = other.temperature_c;
        }
        if self.ecc_total.is_none() {
            self.ecc_total = other.ecc_total;
        }
        if self.xid_code.is_none() {
            self.xid_code = other.xid_code;
        }
        if self.power_violations.is_none() {
            self.power_violations = other.power_violations;
        }
        if self.thermal_violations.is_none() {
            self.thermal_violations = other.thermal_violations;
        }
        if self.reliability_violations.is_none() {
            self.reliability_violations = other.reliability_violations;
        }
        self.last_updated = max_ts(self.last_updated, other.last_updated);
    }
}

fn max_ts(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Telemetry for one node, indexed by GPU UUID and by GPU index.
#[derive(Debug, Clone, Default)]
pub struct NodeTelemetry {
    pub by_uuid: HashMap<String, TelemetryPoint>,
    pub by_index: HashMap<String, TelemetryPoint>,
}

impl NodeTelemetry {
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty() && self.by_index.is_empty()
    }

    /// Look up the merged point for a device.
    ///
    /// The UUID entry is primary; index entry fields only fill gaps the
    /// primary leaves. Returns `None` when neither lookup hits.
    pub fn find(&self, uuid: &str, index: &str) -> Option<TelemetryPoint> {
        let primary = (!uuid.is_empty()).then(|| self.by_uuid.get(uuid)).flatten();
        let secondary = (!index.is_empty())
            .then(|| self.by_index.get(index))
            .flatten();

        match (primary, secondary) {
            (None, None) => None,
            (Some(p), None) => Some(p.clone()),
            (None, Some(s)) => Some(s.clone()),
            (Some(p), Some(s)) => {
                let mut merged = p.clone();
                merged.fill_missing_from(s);
                Some(merged)
            }
        }
    }
}

/// Parse a full exporter exposition body into a per-node telemetry index.
///
/// Unrecognized metrics and malformed lines are skipped. Points with no
/// timestamp are stamped with the exporter heartbeat when present, otherwise
/// with the current wall clock. A heartbeat line that is present but
/// malformed invalidates the scrape and yields an empty index.
pub fn parse_exporter_metrics(body: &str) -> NodeTelemetry {
    let mut telemetry = NodeTelemetry::default();
    let mut heartbeat: Option<DateTime<Utc>> = None;
    let mut heartbeat_malformed = false;

    for line in body.lines() {
        let Some(parsed) = parse_metric_line(line) else {
            if line
                .split_whitespace()
                .next()
                .is_some_and(|t| t == EXPORTER_HEARTBEAT_METRIC)
            {
                debug!(line, "Malformed exporter heartbeat line");
                heartbeat_malformed = true;
            }
            continue;
        };

        if parsed.name == EXPORTER_HEARTBEAT_METRIC {
            // NaN/Inf/missing never reach this point; a zero heartbeat is
            // treated as absent.
            if let Some(ts) = seconds_to_timestamp(parsed.value) {
                heartbeat = Some(ts);
            }
            continue;
        }

        let mut point = TelemetryPoint::default();
        match parsed.name.as_str() {
            METRIC_GPU_TEMP => point.temperature_c = Some(parsed.value.trunc() as i32),
            METRIC_ECC_DBE_TOTAL => point.ecc_total = Some(parsed.value as i64),
            METRIC_XID_ERRORS => point.xid_code = Some(parsed.value as i64),
            METRIC_POWER_VIOLATION => point.power_violations = Some(parsed.value as i64),
            METRIC_THERMAL_VIOLATION => point.thermal_violations = Some(parsed.value as i64),
            METRIC_RELIABILITY_VIOLATION => {
                point.reliability_violations = Some(parsed.value as i64)
            }
            _ => continue,
        }
        if point.is_empty() {
            continue;
        }

        if let Some(uuid) = parsed.labels.get(LABEL_UUID) {
            telemetry
                .by_uuid
                .entry(uuid.clone())
                .or_default()
                .merge_from(&point);
        }
        if let Some(index) = parsed.labels.get(LABEL_GPU) {
            telemetry
                .by_index
                .entry(index.clone())
                .or_default()
                .merge_from(&point);
        }
    }

    if heartbeat_malformed {
        return NodeTelemetry::default();
    }

    let stamp = heartbeat.unwrap_or_else(Utc::now);
    for point in telemetry
        .by_uuid
        .values_mut()
        .chain(telemetry.by_index.values_mut())
    {
        if point.last_updated.is_none() {
            point.last_updated = Some(stamp);
        }
    }

    telemetry
}

/// Convert fractional epoch seconds into a timestamp, fraction as nanoseconds.
fn seconds_to_timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    let secs = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_labels() {
        let parsed =
            parse_metric_line(r#"DCGM_FI_DEV_GPU_TEMP{gpu="0",uuid="GPU-AAA"} 44"#).unwrap();
        assert_eq!(parsed.name, "DCGM_FI_DEV_GPU_TEMP");
        assert_eq!(parsed.labels.get("gpu").unwrap(), "0");
        assert_eq!(parsed.labels.get("uuid").unwrap(), "GPU-AAA");
        assert_eq!(parsed.value, 44.0);
    }

    #[test]
    fn test_parse_line_without_labels() {
        let parsed = parse_metric_line("dcgm_exporter_last_update_time_seconds 1700000000.5")
            .unwrap();
        assert_eq!(parsed.name, "dcgm_exporter_last_update_time_seconds");
        assert!(parsed.labels.is_empty());
        assert_eq!(parsed.value, 1_700_000_000.5);
    }

    #[test]
    fn test_parse_line_rejects_comments_blanks_and_bad_values() {
        assert!(parse_metric_line("").is_none());
        assert!(parse_metric_line("   ").is_none());
        assert!(parse_metric_line("# HELP DCGM_FI_DEV_GPU_TEMP temp").is_none());
        assert!(parse_metric_line("DCGM_FI_DEV_GPU_TEMP NaN").is_none());
        assert!(parse_metric_line("DCGM_FI_DEV_GPU_TEMP +Inf").is_none());
        assert!(parse_metric_line("DCGM_FI_DEV_GPU_TEMP -Inf").is_none());
        assert!(parse_metric_line("DCGM_FI_DEV_GPU_TEMP").is_none());
        assert!(parse_metric_line("DCGM_FI_DEV_GPU_TEMP abc").is_none());
    }

    #[test]
    fn test_parse_line_unclosed_brace_keeps_name() {
        let parsed = parse_metric_line(r#"DCGM_FI_DEV_GPU_TEMP{gpu="0 44"#).unwrap();
        assert_eq!(parsed.name, r#"DCGM_FI_DEV_GPU_TEMP{gpu="0"#);
        assert!(parsed.labels.is_empty());
        assert_eq!(parsed.value, 44.0);
    }

    #[test]
    fn test_parse_label_items_without_eq_are_skipped() {
        let parsed =
            parse_metric_line(r#"DCGM_FI_DEV_XID_ERRORS{gpu="1",oops,uuid="GPU-B"} 0"#).unwrap();
        assert_eq!(parsed.labels.len(), 2);
    }

    #[test]
    fn test_exporter_metrics_indexed_by_both_keys() {
        let body = r#"
# HELP DCGM_FI_DEV_GPU_TEMP GPU temperature
DCGM_FI_DEV_GPU_TEMP{gpu="0",uuid="GPU-AAA"} 41.7
DCGM_FI_DEV_ECC_DBE_AGG_TOTAL{gpu="0",uuid="GPU-AAA"} 3
DCGM_FI_DEV_XID_ERRORS{gpu="0",uuid="GPU-AAA"} 0
dcgm_exporter_last_update_time_seconds 1700000000
"#;
        let telemetry = parse_exporter_metrics(body);
        let point = telemetry.find("GPU-AAA", "0").unwrap();
        assert_eq!(point.temperature_c, Some(41));
        assert_eq!(point.ecc_total, Some(3));
        assert_eq!(point.xid_code, Some(0));
        assert_eq!(
            point.last_updated.unwrap(),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        );
        assert!(telemetry.by_uuid.contains_key("GPU-AAA"));
        assert!(telemetry.by_index.contains_key("0"));
    }

    #[test]
    fn test_exporter_metrics_malformed_heartbeat_empties_scrape() {
        let body = r#"
DCGM_FI_DEV_GPU_TEMP{gpu="0"} 41
dcgm_exporter_last_update_time_seconds NaN
"#;
        assert!(parse_exporter_metrics(body).is_empty());

        let body = r#"
DCGM_FI_DEV_GPU_TEMP{gpu="0"} 41
dcgm_exporter_last_update_time_seconds +Inf
"#;
        assert!(parse_exporter_metrics(body).is_empty());

        let body = r#"
DCGM_FI_DEV_GPU_TEMP{gpu="0"} 41
dcgm_exporter_last_update_time_seconds
"#;
        assert!(parse_exporter_metrics(body).is_empty());
    }

    #[test]
    fn test_exporter_metrics_without_heartbeat_stamps_now() {
        let before = Utc::now();
        let telemetry = parse_exporter_metrics(r#"DCGM_FI_DEV_GPU_TEMP{gpu="0"} 41"#);
        let point = telemetry.find("", "0").unwrap();
        assert!(point.last_updated.unwrap() >= before);
    }

    #[test]
    fn test_find_prefers_uuid_fields_and_fills_from_index() {
        let mut telemetry = NodeTelemetry::default();
        telemetry.by_uuid.insert(
            "GPU-AAA".to_string(),
            TelemetryPoint {
                temperature_c: Some(50),
                last_updated: DateTime::from_timestamp(100, 0),
                ..Default::default()
            },
        );
        telemetry.by_index.insert(
            "0".to_string(),
            TelemetryPoint {
                temperature_c: Some(70),
                ecc_total: Some(9),
                last_updated: DateTime::from_timestamp(200, 0),
                ..Default::default()
            },
        );

        let point = telemetry.find("GPU-AAA", "0").unwrap();
        assert_eq!(point.temperature_c, Some(50), "uuid field wins");
        assert_eq!(point.ecc_total, Some(9), "index fills the gap");
        assert_eq!(point.last_updated, DateTime::from_timestamp(200, 0));
    }

    #[test]
    fn test_find_misses() {
        let telemetry = NodeTelemetry::default();
        assert!(telemetry.find("GPU-AAA", "0").is_none());
        assert!(telemetry.find("", "").is_none());
    }

    #[test]
    fn test_heartbeat_fraction_becomes_nanos() {
        let ts = seconds_to_timestamp(1_700_000_000.25).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_nanos(), 250_000_000);
    }
}
