use crate::client::{rpc_url, AUTH_HEADER, PROTOCOL_VERSION_HEADER, UNLEASH_PATH};
use crate::error::AppError;
use crate::models::ConnectionDescriptor;
use crate::platform::{host_strategy, PlatformStrategy, ProcessInfo};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a shell command line and returns its stdout.
    async fn run(&self, command: &str, timeout: Duration) -> Result<String, AppError>;
}

#[async_trait]
pub trait PortProber: Send + Sync {
    /// True if `port` answers the diagnostic RPC with HTTP 200.
    async fn probe(&self, port: u16, auth_token: &str) -> bool;
}

pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<String, AppError> {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| AppError::Timeout(timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() && stdout.trim().is_empty() {
            return Err(AppError::Discovery(format!(
                "`{command}` exited with {}",
                output.status
            )));
        }
        Ok(stdout)
    }
}

pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl PortProber for HttpProber {
    async fn probe(&self, port: u16, auth_token: &str) -> bool {
        let url = match rpc_url(port, UNLEASH_PATH) {
            Ok(url) => url,
            Err(e) => {
                debug!("Cannot build probe URL for port {}: {}", port, e);
                return false;
            }
        };
        let result = self
            .client
            .post(url)
            .header(PROTOCOL_VERSION_HEADER, "1")
            .header(AUTH_HEADER, auth_token)
            .json(&json!({ "wrapper_data": {} }))
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!("Probe on port {} failed: {}", port, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocatorSettings {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub process_timeout: Duration,
    pub port_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(500),
            process_timeout: Duration::from_secs(5),
            port_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Finds the running language server and the port that really speaks its
/// RPC protocol.
pub struct ProcessLocator {
    strategy: Box<dyn PlatformStrategy>,
    runner: Box<dyn CommandRunner>,
    prober: Box<dyn PortProber>,
    settings: LocatorSettings,
    process_name: String,
}

impl ProcessLocator {
    pub fn new(
        strategy: Box<dyn PlatformStrategy>,
        runner: Box<dyn CommandRunner>,
        prober: Box<dyn PortProber>,
        settings: LocatorSettings,
        process_name: Option<String>,
    ) -> Self {
        let process_name =
            process_name.unwrap_or_else(|| strategy.default_process_name().to_string());
        Self {
            strategy,
            runner,
            prober,
            settings,
            process_name,
        }
    }

    /// Locator wired to the real shell and HTTPS prober for this host.
    pub fn for_host(
        client: Client,
        settings: LocatorSettings,
        process_name: Option<String>,
    ) -> Self {
        let prober = HttpProber::new(client, settings.probe_timeout);
        Self::new(
            host_strategy(),
            Box::new(ShellRunner),
            Box::new(prober),
            settings,
            process_name,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.settings.attempts
    }

    /// Returns `None` once every attempt has failed; callers may retry later.
    pub async fn detect(&self) -> Option<ConnectionDescriptor> {
        let attempts = self.settings.attempts.max(1);
        for attempt in 1..=attempts {
            debug!(
                "Detection attempt {}/{} on {} for '{}'",
                attempt,
                attempts,
                self.strategy.name(),
                self.process_name
            );
            if let Some(descriptor) = self.attempt().await {
                info!(
                    "Language server pid={} verified on port {}",
                    descriptor.process_id, descriptor.connect_port
                );
                return Some(descriptor);
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        debug!("Language server not found after {} attempt(s)", attempts);
        None
    }

    async fn attempt(&self) -> Option<ConnectionDescriptor> {
        let process = self.find_process().await?;

        let ports = match self
            .runner
            .run(
                &self.strategy.port_list_command(process.pid),
                self.settings.port_timeout,
            )
            .await
        {
            Ok(output) => self.strategy.parse_ports(&output, process.pid),
            Err(e) => {
                debug!("Port listing for pid {} failed: {}", process.pid, e);
                Vec::new()
            }
        };
        if ports.is_empty() {
            debug!("No listening ports for pid {}", process.pid);
            return None;
        }

        for port in ports {
            if self.prober.probe(port, &process.auth_token).await {
                return Some(ConnectionDescriptor {
                    process_id: process.pid,
                    extension_port: process.extension_port,
                    connect_port: port,
                    auth_token: process.auth_token,
                });
            }
        }
        debug!("No port of pid {} answered the probe", process.pid);
        None
    }

    async fn find_process(&self) -> Option<ProcessInfo> {
        let primary = self.strategy.process_list_command(&self.process_name);
        if let Some(info) = self.list_and_parse(&primary).await {
            return Some(info);
        }
        let fallback = self
            .strategy
            .fallback_process_list_command(&self.process_name)?;
        self.list_and_parse(&fallback).await
    }

    async fn list_and_parse(&self, command: &str) -> Option<ProcessInfo> {
        match self.runner.run(command, self.settings.process_timeout).await {
            Ok(output) => self.strategy.parse_process_info(&output),
            Err(e) => {
                debug!("Process listing failed: {}", e);
                None
            }
        }
    }
}
