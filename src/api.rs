use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const API_BASE_URL: &str = "https://slack.com/api";
const RTM_START_PATH: &str = "/rtm.start";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new() -> Result<Self, HandshakeError> {
        Self::with_options(ApiClientOptions::default())
    }

    pub fn with_options(options: ApiClientOptions) -> Result<Self, HandshakeError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(HandshakeError::Transport)?;

        Ok(Self {
            http,
            base_url: normalize_base_url(&options.base_url),
            request_timeout: options.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Calls `rtm.start` and returns the stream endpoint and local identity.
    ///
    /// A well-formed response with `ok: false` is reported as
    /// [`HandshakeError::Service`] carrying the service error string.
    pub async fn rtm_start(&self, token: &SecretString) -> Result<HandshakeResult, HandshakeError> {
        let response = self
            .http
            .get(self.endpoint(RTM_START_PATH))
            .query(&[("token", token.expose_secret().as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(HandshakeError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(HandshakeError::Transport)?;

        if !status.is_success() {
            return Err(HandshakeError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_rtm_start_response(&body)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Identity of the local participant assigned by the handshake.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub email_domain: String,
}

/// Decoded `rtm.start` response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResult {
    pub ok: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "self", default)]
    pub self_info: SelfInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamInfo>,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake request failed: {0}")]
    Transport(reqwest::Error),

    #[error("handshake http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("handshake rejected by service: {error}")]
    Service { error: String },

    #[error("failed to parse handshake response: {0}")]
    Parse(String),
}

pub(crate) fn parse_rtm_start_response(body: &str) -> Result<HandshakeResult, HandshakeError> {
    let result: HandshakeResult =
        serde_json::from_str(body).map_err(|err| HandshakeError::Parse(err.to_string()))?;

    if !result.ok {
        return Err(HandshakeError::Service {
            error: result
                .error
                .unwrap_or_else(|| "unknown failure".to_string()),
        });
    }

    if result.url.trim().is_empty() {
        return Err(HandshakeError::Parse(
            "ok response missing stream url".to_string(),
        ));
    }

    Ok(result)
}

pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end().trim_end_matches('/').to_string()
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_base_url, parse_rtm_start_response, summarize_error_body, ApiClient,
        ApiClientOptions, HandshakeError, API_BASE_URL,
    };

    #[test]
    fn parse_ok_response_extracts_url_and_self_id() {
        let payload = r#"{
            "ok": true,
            "url": "wss://x",
            "self": {"id": "U1", "name": "bot", "created": 1, "manual_presence": "active"},
            "team": {"id": "T1", "name": "Team", "domain": "team"},
            "users": [], "channels": []
        }"#;
        let parsed = parse_rtm_start_response(payload).expect("parse ok response");

        assert!(parsed.ok);
        assert_eq!(parsed.url, "wss://x");
        assert_eq!(parsed.self_info.id, "U1");
        assert_eq!(parsed.self_info.name, "bot");
        let team = parsed.team.expect("team");
        assert_eq!(team.id, "T1");
        assert_eq!(team.domain, "team");
        assert!(team.email_domain.is_empty());
    }

    #[test]
    fn parse_not_ok_response_reports_service_error() {
        let error = parse_rtm_start_response(r#"{"ok":false,"error":"invalid_auth"}"#)
            .expect_err("ok=false should error");

        match &error {
            HandshakeError::Service { error } => assert_eq!(error, "invalid_auth"),
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert!(error.to_string().contains("invalid_auth"));
    }

    #[test]
    fn parse_not_ok_without_error_field() {
        let error = parse_rtm_start_response(r#"{"ok":false}"#).expect_err("should error");
        assert!(matches!(error, HandshakeError::Service { .. }));
    }

    #[test]
    fn parse_rejects_malformed_body() {
        let error = parse_rtm_start_response("<html>").expect_err("should error");
        assert!(matches!(error, HandshakeError::Parse(_)));

        let error = parse_rtm_start_response(r#"{"url":"wss://x"}"#).expect_err("ok is required");
        assert!(matches!(error, HandshakeError::Parse(_)));
    }

    #[test]
    fn parse_rejects_ok_without_url() {
        let error = parse_rtm_start_response(r#"{"ok":true,"self":{"id":"U1"}}"#)
            .expect_err("missing url should error");
        assert!(matches!(error, HandshakeError::Parse(_)));
    }

    #[test]
    fn error_body_summary_prefers_error_field() {
        assert_eq!(summarize_error_body(r#"{"error":"ratelimited"}"#), "ratelimited");
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(API_BASE_URL, "https://slack.com/api");
        assert_eq!(
            normalize_base_url("http://127.0.0.1:9000/api/  \n"),
            "http://127.0.0.1:9000/api"
        );

        let options = ApiClientOptions {
            base_url: "http://localhost:8080/api/".to_string(),
            ..ApiClientOptions::default()
        };
        let client = ApiClient::with_options(options).expect("build client");
        assert_eq!(client.base_url(), "http://localhost:8080/api");
        assert_eq!(
            client.endpoint("/rtm.start"),
            "http://localhost:8080/api/rtm.start"
        );
    }
}
