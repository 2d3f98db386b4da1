use crate::models::{
    EnrichedResource, EnrichedSnapshot, HistoryEntry, ResourceQuota, Snapshot, Trend,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

pub const HISTORY_CAPACITY: usize = 20;
const ACTIVE_BURN_THRESHOLD: f64 = 1.0;
const ACTIVE_WEIGHT: f64 = 3.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Rolling quota history for one monitoring session.
///
/// Every call to [`AnalyticsEngine::analyze`] appends to the history, so the
/// result depends on the sequence of snapshots seen so far, and on nothing
/// else: "now" is always the snapshot's own timestamp.
pub struct AnalyticsEngine {
    history: VecDeque<HistoryEntry>,
    baselines: HashMap<String, u8>,
    session_start: DateTime<Utc>,
    last_active: Option<String>,
    capacity: usize,
}

impl AnalyticsEngine {
    pub fn new(session_start: DateTime<Utc>) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY + 1),
            baselines: HashMap::new(),
            session_start,
            last_active: None,
            capacity: HISTORY_CAPACITY,
        }
    }

    /// Forgets everything, e.g. after the language server was restarted.
    pub fn reset(&mut self, session_start: DateTime<Utc>) {
        self.history.clear();
        self.baselines.clear();
        self.last_active = None;
        self.session_start = session_start;
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    fn record(&mut self, snapshot: &Snapshot) {
        self.history.push_back(HistoryEntry::from_snapshot(snapshot));
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        for r in &snapshot.resources {
            self.baselines
                .entry(r.id.clone())
                .or_insert(r.remaining_percent);
        }
    }

    /// Percentage points per hour between the oldest and newest retained
    /// entries. Never negative.
    pub fn burn_rate(&self, id: &str) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let (Some(oldest), Some(newest)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };
        let (Some(&start), Some(&end)) = (oldest.percentages.get(id), newest.percentages.get(id))
        else {
            return 0.0;
        };
        let elapsed_hours =
            (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / MS_PER_HOUR;
        if elapsed_hours <= 0.0 {
            return 0.0;
        }
        ((f64::from(start) - f64::from(end)) / elapsed_hours).max(0.0)
    }

    fn session_usage(&self, r: &ResourceQuota) -> f64 {
        self.baselines
            .get(&r.id)
            .map(|&base| (f64::from(base) - f64::from(r.remaining_percent)).max(0.0))
            .unwrap_or(0.0)
    }

    pub fn analyze(&mut self, snapshot: &Snapshot) -> EnrichedSnapshot {
        self.record(snapshot);
        let now = snapshot.timestamp;

        let rates: Vec<f64> = snapshot
            .resources
            .iter()
            .map(|r| self.burn_rate(&r.id))
            .collect();
        let top_burner = strict_max_index(&rates).filter(|&i| rates[i] > ACTIVE_BURN_THRESHOLD);

        let mut resources: Vec<EnrichedResource> = snapshot
            .resources
            .iter()
            .zip(&rates)
            .enumerate()
            .map(|(i, (r, &burn_rate))| {
                let is_active =
                    top_burner == Some(i) || self.last_active.as_deref() == Some(r.id.as_str());
                let (predicted_exhaustion, predicted_exhaustion_label) =
                    predict_exhaustion(r, burn_rate, now);
                EnrichedResource {
                    burn_rate,
                    burn_rate_label: burn_rate_label(burn_rate).to_string(),
                    predicted_exhaustion,
                    predicted_exhaustion_label,
                    trend: classify_trend(r.remaining_percent, burn_rate),
                    session_usage: self.session_usage(r),
                    is_active,
                    quota: r.clone(),
                }
            })
            .collect();

        if let Some(i) = top_burner {
            self.last_active = Some(snapshot.resources[i].id.clone());
        }

        resources.sort_by(|a, b| {
            b.is_active
                .cmp(&a.is_active)
                .then(a.quota.remaining_percent.cmp(&b.quota.remaining_percent))
        });

        let (overall_health, health_label) = overall_health(&resources);
        let total_session_usage = if resources.is_empty() {
            0
        } else {
            let sum: f64 = resources.iter().map(|r| r.session_usage).sum();
            (sum / resources.len() as f64).round().clamp(0.0, 100.0) as u8
        };

        EnrichedSnapshot {
            timestamp: snapshot.timestamp,
            resources,
            credits: snapshot.credits.clone(),
            plan_name: snapshot.plan_name.clone(),
            overall_health,
            health_label: health_label.to_string(),
            session_start_time: self.session_start,
            total_session_usage,
        }
    }
}

/// Index of the single largest value; `None` when empty or the maximum is
/// shared.
fn strict_max_index(values: &[f64]) -> Option<usize> {
    let (idx, max) = values
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let ties = values.iter().filter(|&&v| v == max).count();
    (ties == 1).then_some(idx)
}

fn predict_exhaustion(
    r: &ResourceQuota,
    burn_rate: f64,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, String) {
    if r.is_exhausted || r.remaining_percent == 0 {
        return (None, "Exhausted".into());
    }
    if burn_rate > 0.0 && r.remaining_percent > 0 {
        let hours = f64::from(r.remaining_percent) / burn_rate;
        let at = now + Duration::milliseconds((hours * MS_PER_HOUR).round() as i64);
        return (Some(at), format_eta(hours));
    }
    (None, "Safe".into())
}

fn format_eta(hours: f64) -> String {
    if hours > 48.0 {
        return format!("~{}d", (hours / 24.0).round() as i64);
    }
    let minutes = (hours * 60.0).round() as i64;
    if hours > 1.0 {
        let (h, m) = (minutes / 60, minutes % 60);
        return if m == 0 {
            format!("~{h}h")
        } else {
            format!("~{h}h {m}m")
        };
    }
    if minutes == 0 {
        "<1m".into()
    } else {
        format!("~{minutes}m")
    }
}

pub fn classify_trend(remaining_percent: u8, burn_rate: f64) -> Trend {
    if remaining_percent <= 10 || burn_rate > 20.0 {
        Trend::Critical
    } else if remaining_percent <= 25 || burn_rate > 10.0 {
        Trend::Warning
    } else if burn_rate > 2.0 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

pub fn burn_rate_label(burn_rate: f64) -> &'static str {
    if burn_rate <= 0.5 {
        "Minimal"
    } else if burn_rate <= 2.0 {
        "Slow"
    } else if burn_rate <= 5.0 {
        "Moderate"
    } else if burn_rate <= 15.0 {
        "Fast"
    } else {
        "Very Fast"
    }
}

fn overall_health(resources: &[EnrichedResource]) -> (u8, &'static str) {
    if resources.is_empty() {
        return (100, "Unknown");
    }
    let (weighted, weights) = resources.iter().fold((0.0, 0.0), |(sum, w), r| {
        let weight = if r.is_active { ACTIVE_WEIGHT } else { 1.0 };
        (sum + f64::from(r.quota.remaining_percent) * weight, w + weight)
    });
    let health = (weighted / weights).round().clamp(0.0, 100.0) as u8;
    let label = match health {
        75.. => "Excellent",
        50..=74 => "Good",
        25..=49 => "Low",
        _ => "Critical",
    };
    (health, label)
}
