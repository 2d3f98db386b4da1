use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A language server endpoint confirmed by a live handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub process_id: u32,
    pub extension_port: u16,
    pub connect_port: u16,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub id: String,
    pub label: String,
    pub remaining_fraction: f64,
    pub remaining_percent: u8,
    pub is_exhausted: bool,
    pub reset_time: DateTime<Utc>,
    pub time_until_reset_ms: i64,
    pub time_until_reset_label: String,
}

impl ResourceQuota {
    /// Builds a quota entry; percent, exhaustion and reset countdown are all
    /// derived here so they can never disagree with the fraction.
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        remaining_fraction: f64,
        reset_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let fraction = if remaining_fraction.is_finite() {
            remaining_fraction.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let time_until_reset_ms = (reset_time - now).num_milliseconds();
        Self {
            id: id.into(),
            label: label.into(),
            remaining_fraction: fraction,
            remaining_percent: (fraction * 100.0).round() as u8,
            is_exhausted: fraction == 0.0,
            reset_time,
            time_until_reset_ms,
            time_until_reset_label: format_duration(time_until_reset_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub available: f64,
    pub monthly: f64,
    pub used_percent: i64,
    pub remaining_percent: i64,
}

impl CreditBalance {
    /// Returns `None` when there is no usable monthly allowance.
    pub fn from_plan(available: f64, monthly: f64) -> Option<Self> {
        if monthly.is_nan() || monthly <= 0.0 || !available.is_finite() {
            return None;
        }
        Some(Self {
            available,
            monthly,
            used_percent: ((monthly - available) / monthly * 100.0).round() as i64,
            remaining_percent: (available / monthly * 100.0).round() as i64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub resources: Vec<ResourceQuota>,
    pub credits: Option<CreditBalance>,
    pub plan_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub percentages: BTreeMap<String, u8>,
}

impl HistoryEntry {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            percentages: snapshot
                .resources
                .iter()
                .map(|r| (r.id.clone(), r.remaining_percent))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Stable,
    Decreasing,
    Warning,
    Critical,
}

impl Trend {
    pub fn as_label(self) -> &'static str {
        match self {
            Trend::Stable => "stable",
            Trend::Decreasing => "decreasing",
            Trend::Warning => "warning",
            Trend::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedResource {
    #[serde(flatten)]
    pub quota: ResourceQuota,
    pub burn_rate: f64,
    pub burn_rate_label: String,
    pub predicted_exhaustion: Option<DateTime<Utc>>,
    pub predicted_exhaustion_label: String,
    pub trend: Trend,
    pub session_usage: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedSnapshot {
    pub timestamp: DateTime<Utc>,
    pub resources: Vec<EnrichedResource>,
    pub credits: Option<CreditBalance>,
    pub plan_name: Option<String>,
    pub overall_health: u8,
    pub health_label: String,
    pub session_start_time: DateTime<Utc>,
    pub total_session_usage: u8,
}

/// Human label for a countdown in milliseconds: "Ready", "59m", "2h 1m", "1d 1h".
pub fn format_duration(ms: i64) -> String {
    if ms <= 0 {
        return "Ready".into();
    }
    let total_minutes = (ms + 59_999) / 60_000;
    if total_minutes < 60 {
        return format!("{total_minutes}m");
    }
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours < 24 {
        return if minutes == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {minutes}m")
        };
    }
    let days = hours / 24;
    let hours = hours % 24;
    if hours == 0 {
        format!("{days}d")
    } else {
        format!("{days}d {hours}h")
    }
}
