// Warden - Capability constraints
//
// Optional conditions attached to a grant at issue time and checked on
// every validation, after expiry and signature. All clock arithmetic is
// in UTC; hours are 0-23 and days of week count from Sunday = 0.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Context metadata key carrying the caller's source address.
pub const SOURCE_IP_KEY: &str = "source_ip";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConstraints {
    /// Allowed values of the `source_ip` context metadata entry.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    /// Required context values. `service`, `environment` and `namespace`
    /// name the context fields; any other key is looked up in metadata.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindow {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hours: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub days_of_week: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blackout_periods: Vec<TimeRange>,
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl CapabilityConstraints {
    pub fn is_empty(&self) -> bool {
        self.ip_addresses.is_empty() && self.time_window.is_none() && self.environment.is_empty()
    }

    /// Check every constraint against `now` and the caller's context.
    /// The error names the first violated constraint.
    pub fn check(&self, now: DateTime<Utc>, context: Option<&Context>) -> Result<(), String> {
        if !self.ip_addresses.is_empty() {
            let Some(ip) = context.and_then(|ctx| ctx.metadata_value(SOURCE_IP_KEY)) else {
                return Err("IP address constraint violation: no source IP provided".to_string());
            };
            if !self.ip_addresses.iter().any(|allowed| allowed == ip) {
                return Err(format!(
                    "IP address constraint violation: {} not in allowed list",
                    ip
                ));
            }
        }

        if let Some(window) = &self.time_window {
            window
                .check(now)
                .map_err(|e| format!("time window constraint violation: {}", e))?;
        }

        if !self.environment.is_empty() {
            let Some(ctx) = context else {
                return Err("environment constraint violation: no context provided".to_string());
            };
            for (key, expected) in &self.environment {
                let actual = context_value(ctx, key).unwrap_or("");
                if actual != expected {
                    return Err(format!(
                        "environment constraint violation: {}={} (expected {})",
                        key, actual, expected
                    ));
                }
            }
        }

        Ok(())
    }
}

impl TimeWindow {
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), String> {
        if !self.hours.is_empty() && !self.hours.contains(&now.hour()) {
            return Err(format!("current hour {} not in allowed hours", now.hour()));
        }

        let day = now.weekday().num_days_from_sunday();
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&day) {
            return Err(format!("current day {} not in allowed days", day));
        }

        if self.blackout_periods.iter().any(|period| period.contains(now)) {
            return Err("current time is in a blackout period".to_string());
        }

        Ok(())
    }
}

fn context_value<'a>(ctx: &'a Context, key: &str) -> Option<&'a str> {
    match key {
        "service" => Some(ctx.service()),
        "environment" => Some(ctx.environment()),
        "namespace" => ctx.namespace(),
        other => ctx.metadata_value(other),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
