//! Device health state machine
//!
//! Translates telemetry counter deltas into health transitions. Monotonic
//! counters are tracked as stored baselines in the health metrics map; a
//! fault is raised only on a strict increase over a previously known sample,
//! and cleared again after a run of consecutive healthy samples.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::status::DeviceHealth;
use crate::telemetry::TelemetryPoint;

/// Consecutive healthy samples required to clear a fault.
pub const DEVICE_HEALTH_RECOVERY_THRESHOLD: i32 = 3;

/// Keys of the counter baselines kept in the health metrics map.
pub mod metric_keys {
    pub const ECC_DBE_TOTAL: &str = "ecc.dbe.total";
    pub const XID_CODE: &str = "xid.code";
    pub const POWER_VIOLATIONS: &str = "power.violations";
    pub const THERMAL_VIOLATIONS: &str = "thermal.violations";
    pub const RELIABILITY_VIOLATIONS: &str = "reliability.violations";
}

/// Fault kinds, in priority order. When several counters fire in one sample
/// the highest-priority kind wins and the rest land only in the metrics map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    XidError,
    EccDoubleBitError,
    PowerViolation,
    ThermalViolation,
    ReliabilityViolation,
}

impl FaultReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultReason::XidError => "XIDError",
            FaultReason::EccDoubleBitError => "ECCDoubleBitError",
            FaultReason::PowerViolation => "PowerViolation",
            FaultReason::ThermalViolation => "ThermalViolation",
            FaultReason::ReliabilityViolation => "ReliabilityViolation",
        }
    }
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health transition produced by one telemetry sample.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthTransition {
    Degraded { reason: FaultReason, message: String },
    Recovered,
}

/// Update one monotonic counter baseline.
///
/// `None` removes the key. The first observation (key absent or
/// `first_sample`) seeds the baseline silently. A strict increase stores the
/// new value and reports a violation; any other value still lands so later
/// comparisons use the freshest sample.
pub fn update_monotonic_metric(
    health: &mut DeviceHealth,
    key: &str,
    value: Option<i64>,
    first_sample: bool,
) -> bool {
    let Some(value) = value else {
        health.metrics.remove(key);
        return false;
    };

    let stored = health.metrics.get(key).and_then(|v| v.parse::<i64>().ok());
    health.metrics.insert(key.to_string(), value.to_string());

    match stored {
        None => false,
        Some(_) if first_sample => false,
        Some(stored) => value > stored,
    }
}

/// Record a fault that did not come from a telemetry sample (manual marking,
/// detection-side conditions). A zero timestamp leaves `last_error_time`
/// untouched.
pub fn track_device_fault(
    health: &mut DeviceHealth,
    reason: &str,
    message: &str,
    ts: Option<DateTime<Utc>>,
) {
    health.last_error_reason = Some(reason.to_string());
    health.last_error = Some(message.to_string());
    if ts.is_some() {
        health.last_error_time = ts;
    }
    health.consecutive_healthy = 0;
}

/// Fill the temperature from a detection reading. Unlike telemetry, a
/// detection temperature only lands when nothing was known before.
pub fn apply_detection_temperature(health: &mut DeviceHealth, temperature_c: i32) {
    if health.temperature_c == 0 && temperature_c != 0 {
        health.temperature_c = temperature_c;
    }
}

/// Apply one telemetry sample to the device health block, returning the
/// transition it caused, if any.
///
/// A missing sample must not reach this function: absence of telemetry is
/// not evidence of health, so the caller leaves the block untouched.
pub fn apply_telemetry(health: &mut DeviceHealth, point: &TelemetryPoint) -> Option<HealthTransition> {
    // A sample no newer than the last applied one is a re-observation of the
    // same exporter refresh; applying it again would double-count healthy
    // samples and break idempotence.
    if let (Some(ts), Some(prev)) = (point.last_updated, health.last_updated_time) {
        if ts <= prev {
            debug!("Telemetry sample not newer than last applied, skipping");
            return None;
        }
    }

    let first_sample = health.last_updated_time.is_none();

    if let Some(temp) = point.temperature_c {
        health.temperature_c = temp;
    }

    let mut fault: Option<(FaultReason, String)> = None;

    // XID is a code, not a counter: any non-zero code differing from the
    // stored one is a fault; a zero code retires the stored one.
    match point.xid_code {
        Some(0) => {
            health.metrics.remove(metric_keys::XID_CODE);
        }
        Some(code) => {
            let stored = health
                .metrics
                .get(metric_keys::XID_CODE)
                .and_then(|v| v.parse::<i64>().ok());
            let fired = !first_sample && stored != Some(code);
            health
                .metrics
                .insert(metric_keys::XID_CODE.to_string(), code.to_string());
            if fired {
                fault = Some((
                    FaultReason::XidError,
                    format!("device reported XID error {}", code),
                ));
            }
        }
        None => {}
    }

    if update_monotonic_metric(health, metric_keys::ECC_DBE_TOTAL, point.ecc_total, first_sample)
        && fault.is_none()
    {
        fault = Some((
            FaultReason::EccDoubleBitError,
            format!(
                "aggregate double-bit ECC errors rose to {}",
                point.ecc_total.unwrap_or_default()
            ),
        ));
    }
    if let Some(total) = point.ecc_total {
        health.ecc_total = Some(total);
    }

    if update_monotonic_metric(
        health,
        metric_keys::POWER_VIOLATIONS,
        point.power_violations,
        first_sample,
    ) && fault.is_none()
    {
        fault = Some((
            FaultReason::PowerViolation,
            format!(
                "power violation counter rose to {}",
                point.power_violations.unwrap_or_default()
            ),
        ));
    }

    if update_monotonic_metric(
        health,
        metric_keys::THERMAL_VIOLATIONS,
        point.thermal_violations,
        first_sample,
    ) && fault.is_none()
    {
        fault = Some((
            FaultReason::ThermalViolation,
            format!(
                "thermal violation counter rose to {}",
                point.thermal_violations.unwrap_or_default()
            ),
        ));
    }

    if update_monotonic_metric(
        health,
        metric_keys::RELIABILITY_VIOLATIONS,
        point.reliability_violations,
        first_sample,
    ) && fault.is_none()
    {
        fault = Some((
            FaultReason::ReliabilityViolation,
            format!(
                "reliability violation counter rose to {}",
                point.reliability_violations.unwrap_or_default()
            ),
        ));
    }

    let transition = match fault {
        Some((reason, message)) => {
            info!(reason = %reason, message = %message, "Device health degraded");
            health.last_error_reason = Some(reason.as_str().to_string());
            health.last_error = Some(message.clone());
            health.last_error_time = point.last_updated;
            health.consecutive_healthy = 0;
            Some(HealthTransition::Degraded { reason, message })
        }
        None => {
            health.consecutive_healthy += 1;
            if let Some(ts) = point.last_updated {
                health.last_healthy_time = Some(ts);
            }

            if health.consecutive_healthy >= DEVICE_HEALTH_RECOVERY_THRESHOLD
                && health.has_fault()
            {
                info!(
                    healthy_samples = health.consecutive_healthy,
                    "Device health recovered"
                );
                health.last_error_reason = None;
                health.last_error = None;
                health.metrics.remove(metric_keys::POWER_VIOLATIONS);
                health.metrics.remove(metric_keys::THERMAL_VIOLATIONS);
                health.metrics.remove(metric_keys::RELIABILITY_VIOLATIONS);
                if health.metrics.get(metric_keys::XID_CODE).map(String::as_str) == Some("0") {
                    health.metrics.remove(metric_keys::XID_CODE);
                }
                Some(HealthTransition::Recovered)
            } else {
                debug!(
                    healthy_samples = health.consecutive_healthy,
                    "Device sample healthy"
                );
                None
            }
        }
    };

    if point.last_updated.is_some() {
        health.last_updated_time = point.last_updated;
    }

    transition
}
