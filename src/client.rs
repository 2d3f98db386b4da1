use crate::error::AppError;
use crate::models::{ConnectionDescriptor, CreditBalance, ResourceQuota, Snapshot};
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const UNLEASH_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUnleashData";
pub const USER_STATUS_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUserStatus";
pub const AUTH_HEADER: &str = "X-Codeium-Csrf-Token";
pub const PROTOCOL_VERSION_HEADER: &str = "Connect-Protocol-Version";
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback HTTPS endpoint of the language server.
pub fn rpc_url(port: u16, path: &str) -> Result<Url, AppError> {
    let base = Url::parse(&format!("https://127.0.0.1:{port}"))
        .map_err(|e| AppError::Config(format!("invalid port {port}: {e}")))?;
    base.join(path)
        .map_err(|e| AppError::Config(format!("invalid RPC path {path}: {e}")))
}

/// The server uses a self-signed certificate on loopback, so certificate
/// validation is off for this client.
pub fn build_http_client() -> Result<Client, AppError> {
    let client = Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(Duration::from_secs(3))
        .build()?;
    Ok(client)
}

#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub ide_name: String,
    pub extension_name: String,
    pub locale: String,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ide_name: "antigravity".into(),
            extension_name: "antigravity".into(),
            locale: "en".into(),
        }
    }
}

pub struct QuotaClient {
    http: Client,
    metadata: ClientMetadata,
    connection: Option<Arc<ConnectionDescriptor>>,
    last_snapshot: Option<Snapshot>,
    timeout: Duration,
}

impl QuotaClient {
    pub fn new(http: Client, metadata: ClientMetadata) -> Self {
        Self {
            http,
            metadata,
            connection: None,
            last_snapshot: None,
            timeout: POLL_TIMEOUT,
        }
    }

    pub fn configure(&mut self, connection: ConnectionDescriptor) {
        self.connection = Some(Arc::new(connection));
    }

    pub fn clear(&mut self) {
        self.connection = None;
    }

    pub fn connection(&self) -> Option<&ConnectionDescriptor> {
        self.connection.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.connect_port > 0 && !c.auth_token.is_empty())
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// One status request against the configured server.
    pub async fn poll(&mut self) -> Result<Snapshot, AppError> {
        if !self.is_configured() {
            return Err(AppError::NotConfigured);
        }
        let Some(connection) = self.connection.clone() else {
            return Err(AppError::NotConfigured);
        };

        let raw = self.fetch_status(&connection).await?;
        let snapshot = normalize_user_status(&raw, Utc::now())?;
        debug!(
            "Polled {} resource(s) from port {}",
            snapshot.resources.len(),
            connection.connect_port
        );
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn fetch_status(&self, connection: &ConnectionDescriptor) -> Result<Value, AppError> {
        let url = rpc_url(connection.connect_port, USER_STATUS_PATH)?;
        let body = json!({
            "metadata": {
                "ideName": self.metadata.ide_name,
                "extensionName": self.metadata.extension_name,
                "locale": self.metadata.locale,
            }
        });

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(PROTOCOL_VERSION_HEADER, "1")
            .header(AUTH_HEADER, &connection.auth_token)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Transport(format!(
                "status request failed with HTTP status {status}"
            )));
        }

        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        decode_body(&text)
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else {
            AppError::Transport(e.to_string())
        }
    }
}

/// A reachable server that answers with something other than JSON is a
/// parse failure, not a transport one.
fn decode_body(text: &str) -> Result<Value, AppError> {
    serde_json::from_str(text).map_err(|e| AppError::Parse(e.to_string()))
}

/// int64 fields arrive as JSON strings from the Connect protocol.
fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn parse_reset_time(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = raw?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Turns a raw `GetUserStatus` payload into a [`Snapshot`].
///
/// Model configs without a `quotaInfo` object are dropped, as are later
/// configs whose id repeats an earlier one. A missing
/// `remainingFraction` means full quota, and a missing `resetTime` means the
/// quota is already resettable.
pub fn normalize_user_status(raw: &Value, now: DateTime<Utc>) -> Result<Snapshot, AppError> {
    if !raw.is_object() {
        return Err(AppError::Parse("expected a JSON object".into()));
    }
    let status = raw.get("userStatus").unwrap_or(&Value::Null);
    let plan_status = status.get("planStatus");

    let plan_info = plan_status.and_then(|p| p.get("planInfo"));
    let monthly = plan_info
        .and_then(|p| p.get("monthlyPromptCredits"))
        .and_then(as_number);
    let available = plan_status
        .and_then(|p| p.get("availablePromptCredits"))
        .and_then(as_number);
    let credits = match (available, monthly) {
        (Some(available), Some(monthly)) => CreditBalance::from_plan(available, monthly),
        _ => None,
    };
    let plan_name = plan_info
        .and_then(|p| p.get("planName"))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let configs = status
        .get("cascadeModelConfigData")
        .and_then(|d| d.get("clientModelConfigs"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let resources = configs
        .iter()
        .filter_map(|config| {
            let quota = config.get("quotaInfo").filter(|q| q.is_object())?;
            let label = config.get("label").and_then(Value::as_str);
            let model = config
                .get("modelOrAlias")
                .and_then(|m| m.get("model"))
                .and_then(Value::as_str);
            let id = model.or(label).unwrap_or("unknown");
            if !seen.insert(id) {
                debug!("Skipping duplicate model config {}", id);
                return None;
            }
            let fraction = quota
                .get("remainingFraction")
                .and_then(as_number)
                .unwrap_or(1.0);
            let reset_time = parse_reset_time(quota.get("resetTime")).unwrap_or(now);
            Some(ResourceQuota::new(
                id,
                label.unwrap_or(id),
                fraction,
                reset_time,
                now,
            ))
        })
        .collect();

    Ok(Snapshot {
        timestamp: now,
        resources,
        credits,
        plan_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn descriptor(port: u16, token: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            process_id: 1,
            extension_port: 2,
            connect_port: port,
            auth_token: token.into(),
        }
    }

    #[test]
    fn normalizes_credits_and_quota_end_to_end() {
        let now = fixed_now();
        let reset = (now + ChronoDuration::hours(1)).to_rfc3339();
        let raw = json!({
            "userStatus": {
                "planStatus": {
                    "planInfo": { "planName": "Pro", "monthlyPromptCredits": 500 },
                    "availablePromptCredits": 350
                },
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        {
                            "label": "Gemini 3 Pro",
                            "modelOrAlias": { "model": "MODEL_PLACEHOLDER_M7" },
                            "quotaInfo": { "remainingFraction": 0.75, "resetTime": reset }
                        }
                    ]
                }
            }
        });

        let snap = normalize_user_status(&raw, now).expect("snapshot");
        let credits = snap.credits.expect("credits");
        assert_eq!(credits.used_percent, 30);
        assert_eq!(credits.remaining_percent, 70);
        assert_eq!(snap.plan_name.as_deref(), Some("Pro"));

        assert_eq!(snap.resources.len(), 1);
        let r = &snap.resources[0];
        assert_eq!(r.id, "MODEL_PLACEHOLDER_M7");
        assert_eq!(r.label, "Gemini 3 Pro");
        assert_eq!(r.remaining_percent, 75);
        assert!(!r.is_exhausted);
        assert_eq!(r.time_until_reset_label, "1h");
    }

    #[test]
    fn drops_entries_without_quota_and_applies_defaults() {
        let now = fixed_now();
        let raw = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        { "label": "No Quota" },
                        { "label": "Defaults", "quotaInfo": {} },
                        { "label": "Spent", "quotaInfo": { "remainingFraction": 0 } }
                    ]
                }
            }
        });

        let snap = normalize_user_status(&raw, now).expect("snapshot");
        assert!(snap.credits.is_none());
        let ids: Vec<&str> = snap.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["Defaults", "Spent"]);

        let defaults = &snap.resources[0];
        assert_eq!(defaults.remaining_percent, 100);
        assert_eq!(defaults.reset_time, now);
        assert_eq!(defaults.time_until_reset_label, "Ready");
        assert!(snap.resources[1].is_exhausted);
    }

    #[test]
    fn null_quota_info_is_dropped() {
        let raw = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        { "label": "NullQuota", "quotaInfo": null },
                        { "label": "Listed", "quotaInfo": { "remainingFraction": 0.4 } }
                    ]
                }
            }
        });
        let snap = normalize_user_status(&raw, fixed_now()).expect("snapshot");
        let ids: Vec<&str> = snap.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["Listed"]);
    }

    #[test]
    fn repeated_ids_keep_the_first_entry() {
        let raw = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        { "label": "Dup", "quotaInfo": { "remainingFraction": 0.2 } },
                        { "label": "Dup", "quotaInfo": { "remainingFraction": 0.9 } },
                        {
                            "label": "Other",
                            "modelOrAlias": { "model": "Dup" },
                            "quotaInfo": { "remainingFraction": 0.5 }
                        }
                    ]
                }
            }
        });
        let snap = normalize_user_status(&raw, fixed_now()).expect("snapshot");
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "Dup");
        assert_eq!(snap.resources[0].remaining_percent, 20);
    }

    #[test]
    fn non_json_body_is_a_parse_error() {
        let err = decode_body("<html>502 Bad Gateway</html>").expect_err("parse error");
        assert!(matches!(err, AppError::Parse(_)));
        assert!(!err.is_transport());
        assert!(decode_body(r#"{"userStatus":{}}"#).is_ok());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();

        let http = build_http_client().expect("http client");
        let mut client = QuotaClient::new(http, ClientMetadata::default());
        client.timeout = std::time::Duration::from_millis(200);
        client.configure(descriptor(port, "tok"));

        let err = client.poll().await.expect_err("timeout");
        assert!(matches!(err, AppError::Timeout(d) if d == std::time::Duration::from_millis(200)));
        assert!(err.is_transport());
        assert!(client.last_snapshot().is_none());
        drop(listener);
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
            listener.local_addr().expect("local addr").port()
        };

        let http = build_http_client().expect("http client");
        let mut client = QuotaClient::new(http, ClientMetadata::default());
        client.configure(descriptor(port, "tok"));

        let err = client.poll().await.expect_err("transport error");
        assert!(matches!(err, AppError::Transport(_)));
    }

    #[test]
    fn credits_absent_without_positive_monthly_allowance() {
        let now = fixed_now();
        let zero = json!({
            "userStatus": { "planStatus": {
                "planInfo": { "monthlyPromptCredits": 0 },
                "availablePromptCredits": 10
            }}
        });
        assert!(normalize_user_status(&zero, now).unwrap().credits.is_none());

        let missing = json!({ "userStatus": { "planStatus": { "availablePromptCredits": 10 } } });
        assert!(normalize_user_status(&missing, now).unwrap().credits.is_none());
    }

    #[test]
    fn accepts_int64_values_encoded_as_strings() {
        let raw = json!({
            "userStatus": { "planStatus": {
                "planInfo": { "monthlyPromptCredits": "1000" },
                "availablePromptCredits": "250"
            }}
        });
        let credits = normalize_user_status(&raw, fixed_now())
            .unwrap()
            .credits
            .expect("credits");
        assert_eq!(credits.remaining_percent, 25);
        assert_eq!(credits.used_percent, 75);
    }

    #[test]
    fn empty_object_yields_empty_snapshot() {
        let snap = normalize_user_status(&json!({}), fixed_now()).expect("snapshot");
        assert!(snap.resources.is_empty());
        assert!(snap.credits.is_none());
    }

    #[test]
    fn non_object_payload_is_a_parse_error() {
        let err = normalize_user_status(&json!([1, 2]), fixed_now()).expect_err("parse error");
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn configured_requires_port_and_token() {
        let mut client = QuotaClient::new(Client::new(), ClientMetadata::default());
        assert!(!client.is_configured());

        client.configure(descriptor(0, "tok"));
        assert!(!client.is_configured());
        client.configure(descriptor(42100, ""));
        assert!(!client.is_configured());
        client.configure(descriptor(42100, "tok"));
        assert!(client.is_configured());

        client.clear();
        assert!(!client.is_configured());
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn poll_without_connection_is_a_configuration_error() {
        let mut client = QuotaClient::new(Client::new(), ClientMetadata::default());
        let err = client.poll().await.expect_err("not configured");
        assert!(matches!(err, AppError::NotConfigured));
        assert!(client.last_snapshot().is_none());
    }

    #[test]
    fn rpc_url_targets_loopback_https() {
        let url = rpc_url(42100, USER_STATUS_PATH).expect("url");
        assert_eq!(
            url.as_str(),
            "https://127.0.0.1:42100/exa.language_server_pb.LanguageServerService/GetUserStatus"
        );
    }
}
