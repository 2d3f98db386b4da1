use crate::analytics::AnalyticsEngine;
use crate::client::{build_http_client, QuotaClient};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::locator::{LocatorSettings, ProcessLocator};
use crate::models::{ConnectionDescriptor, EnrichedSnapshot};
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum TickOutcome {
    NotFound,
    Updated(EnrichedSnapshot),
}

/// Owns one monitoring session: the locator, the client holding the current
/// connection, and the analytics state. Every method takes `&mut self`, so
/// ticks cannot overlap.
pub struct MonitorService {
    locator: ProcessLocator,
    client: QuotaClient,
    engine: AnalyticsEngine,
    alert_threshold: u8,
    alerted: HashSet<String>,
    last_process_id: Option<u32>,
}

impl MonitorService {
    pub fn new(cfg: &AppConfig, settings: LocatorSettings) -> Result<Self, AppError> {
        let http = build_http_client()?;
        let locator = ProcessLocator::for_host(http.clone(), settings, cfg.process_name.clone());
        let client = QuotaClient::new(http, cfg.client_metadata());
        Ok(Self::with_parts(locator, client, cfg.alert_threshold))
    }

    pub fn with_parts(locator: ProcessLocator, client: QuotaClient, alert_threshold: u8) -> Self {
        Self {
            locator,
            client,
            engine: AnalyticsEngine::new(Utc::now()),
            alert_threshold,
            alerted: HashSet::new(),
            last_process_id: None,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionDescriptor> {
        self.client.connection()
    }

    pub fn attempts(&self) -> u32 {
        self.locator.attempts()
    }

    /// Runs discovery and swaps in the new connection. A different process
    /// id starts a fresh analytics session.
    pub async fn detect(&mut self) -> Option<ConnectionDescriptor> {
        let Some(found) = self.locator.detect().await else {
            self.client.clear();
            return None;
        };
        if self
            .last_process_id
            .is_some_and(|pid| pid != found.process_id)
        {
            info!(
                "Language server restarted (pid {}), starting a new session",
                found.process_id
            );
            self.engine.reset(Utc::now());
            self.alerted.clear();
        }
        self.last_process_id = Some(found.process_id);
        self.client.configure(found.clone());
        Some(found)
    }

    /// One cycle: discover if needed, poll, analyze.
    pub async fn tick(&mut self) -> Result<TickOutcome, AppError> {
        if !self.client.is_configured() && self.detect().await.is_none() {
            return Ok(TickOutcome::NotFound);
        }

        let snapshot = match self.client.poll().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.on_poll_error(&e);
                return Err(e);
            }
        };

        let enriched = self.engine.analyze(&snapshot);
        debug!(
            "Analyzed {} resource(s), {} history entries",
            enriched.resources.len(),
            self.engine.history().len()
        );
        self.check_alerts(&enriched);
        Ok(TickOutcome::Updated(enriched))
    }

    /// Transport failures drop the connection so the next tick re-detects.
    /// A parse failure keeps it, since the server did answer.
    fn on_poll_error(&mut self, e: &AppError) {
        if let Some(last) = self.client.last_snapshot() {
            debug!("Last good snapshot was taken at {}", last.timestamp);
        }
        if e.is_transport() {
            warn!("Language server unreachable, will re-detect: {}", e);
            self.client.clear();
        }
    }

    /// Warns once per resource when it drops to the alert threshold; the
    /// alert re-arms after the resource recovers above it.
    fn check_alerts(&mut self, snapshot: &EnrichedSnapshot) -> Vec<String> {
        let mut fired = Vec::new();
        for r in &snapshot.resources {
            let id = &r.quota.id;
            if r.quota.remaining_percent <= self.alert_threshold {
                if self.alerted.insert(id.clone()) {
                    warn!(
                        "{} is at {}% (alert threshold {}%), {}",
                        r.quota.label,
                        r.quota.remaining_percent,
                        self.alert_threshold,
                        r.predicted_exhaustion_label
                    );
                    fired.push(id.clone());
                }
            } else {
                self.alerted.remove(id);
            }
        }
        fired
    }

    /// Ticks every `interval` until `shutdown` flips to true or its sender is
    /// dropped. A tick in progress is allowed to finish.
    pub async fn watch<F>(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_tick: F,
    ) where
        F: FnMut(Result<TickOutcome, AppError>),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stopping monitor");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let result = self.tick().await;
                    on_tick(result);
                }
            }
        }
    }
}
