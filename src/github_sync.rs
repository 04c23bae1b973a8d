//! Pushes the exported dataset to a GitHub repository through the contents API.
//!
//! Create-or-update: look up the current blob sha (404 means the file is new),
//! then PUT the base64 content. A failure here never touches the computed
//! batch, it is only reported.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage_utils::GithubConfig;

const USER_AGENT: &str = "ETF-Update-Tool";
const ACCEPT: &str = "application/vnd.github.v3+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("GitHub token not set (expected in ${0})")]
    MissingToken(String),

    #[error("GitHub rejected the token ({0})")]
    Unauthorized(u16),

    #[error("repository or path not found: {0}")]
    NotFound(String),

    #[error("GitHub rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error talking to GitHub: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub created: bool,
    pub commit_url: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Deserialize)]
struct RepoInfo {
    full_name: String,
}

#[derive(Deserialize, Default)]
struct PutResponse {
    #[serde(default)]
    content: Option<HtmlLink>,
    #[serde(default)]
    commit: Option<HtmlLink>,
}

#[derive(Deserialize)]
struct HtmlLink {
    html_url: Option<String>,
}

pub struct GithubSync {
    client: Client,
    config: GithubConfig,
    token: String,
}

impl GithubSync {
    /// Reads the token from the environment variable the config names.
    pub fn from_env(config: GithubConfig) -> Result<Self, SyncError> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::MissingToken(config.token_env.clone()))?;
        Self::new(config, token)
    }

    pub fn new(config: GithubConfig, token: String) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config, token })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", ACCEPT)
    }

    /// Verifies token and repository access, returning the repository's full name.
    pub async fn check_connection(&self) -> Result<String, SyncError> {
        let url = repo_url(&self.config);
        let response = self.authorized(self.client.get(&url)).send().await?;
        let status = response.status();

        if status.is_success() {
            let repo: RepoInfo = response.json().await?;
            return Ok(repo.full_name);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, &url))
    }

    /// Creates the configured file or replaces its content.
    pub async fn upsert_file(&self, content: &[u8], message: &str) -> Result<SyncOutcome, SyncError> {
        let url = contents_url(&self.config);

        let mut lookup = self.authorized(self.client.get(&url));
        if let Some(branch) = &self.config.branch {
            lookup = lookup.query(&[("ref", branch)]);
        }
        let response = lookup.send().await?;
        let status = response.status();

        let sha = match status {
            StatusCode::OK => Some(response.json::<ContentsEntry>().await?.sha),
            StatusCode::NOT_FOUND => None,
            _ => {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_failure(status, &body, &url));
            }
        };
        debug!(path = %self.config.path, existing = sha.is_some(), "uploading dataset");

        let body = put_body(&self.config, content, message, sha.as_deref());
        let response = self.authorized(self.client.put(&url)).json(&body).send().await?;
        let status = response.status();

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let put: PutResponse = response.json().await.unwrap_or_default();
            let outcome = SyncOutcome {
                created: sha.is_none(),
                commit_url: put.commit.and_then(|c| c.html_url),
                file_url: put.content.and_then(|c| c.html_url),
            };
            info!(path = %self.config.path, created = outcome.created, "dataset pushed");
            return Ok(outcome);
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &text, &url))
    }
}

pub fn repo_url(config: &GithubConfig) -> String {
    format!(
        "{}/repos/{}/{}",
        config.api_url.trim_end_matches('/'),
        config.owner,
        config.repo
    )
}

pub fn contents_url(config: &GithubConfig) -> String {
    format!(
        "{}/contents/{}",
        repo_url(config),
        config.path.trim_start_matches('/')
    )
}

pub fn commit_message(now: DateTime<Utc>) -> String {
    format!("ETF data auto-update - {} UTC", now.format("%Y-%m-%d %H:%M:%S"))
}

pub fn put_body(config: &GithubConfig, content: &[u8], message: &str, sha: Option<&str>) -> Value {
    let mut body = json!({
        "message": message,
        "content": STANDARD.encode(content),
        "committer": {
            "name": config.committer_name,
            "email": config.committer_email,
        },
    });
    if let Some(sha) = sha {
        body["sha"] = json!(sha);
    }
    if let Some(branch) = &config.branch {
        body["branch"] = json!(branch);
    }
    body
}

fn classify_failure(status: StatusCode, body: &str, url: &str) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized(status.as_u16()),
        StatusCode::NOT_FOUND => SyncError::NotFound(url.to_string()),
        _ => SyncError::Rejected {
            status: status.as_u16(),
            message: api_message(body),
        },
    }
}

/// The `message` field of a GitHub error payload.
fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| "Unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(branch: Option<&str>) -> GithubConfig {
        serde_json::from_value(json!({
            "owner": "acme",
            "repo": "etf-data",
            "api_url": "https://api.github.com/",
            "path": "/data/etf.csv",
            "branch": branch,
        }))
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let c = config(None);
        assert_eq!(repo_url(&c), "https://api.github.com/repos/acme/etf-data");
        assert_eq!(contents_url(&c), "https://api.github.com/repos/acme/etf-data/contents/data/etf.csv");
    }

    #[test]
    fn test_create_body_has_no_sha() {
        let body = put_body(&config(None), b"a,b\n1,2\n", "update", None);
        assert_eq!(body["content"], "YSxiCjEsMgo=");
        assert_eq!(body["committer"]["name"], "ETF Update Bot");
        assert!(body.get("sha").is_none());
        assert!(body.get("branch").is_none());
    }

    #[test]
    fn test_update_body_carries_sha_and_branch() {
        let body = put_body(&config(Some("data")), b"x", "update", Some("abc123"));
        assert_eq!(body["sha"], "abc123");
        assert_eq!(body["branch"], "data");
        assert_eq!(body["message"], "update");
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, "", "u"),
            SyncError::Unauthorized(401)
        ));
        assert!(matches!(classify_failure(StatusCode::NOT_FOUND, "", "u"), SyncError::NotFound(_)));

        let err = classify_failure(
            StatusCode::CONFLICT,
            r#"{"message":"is at 1234 but expected 5678"}"#,
            "u",
        );
        assert!(matches!(err, SyncError::Rejected { status: 409, ref message } if message.contains("expected")));
        assert_eq!(api_message("not json"), "Unknown error");
    }

    #[test]
    fn test_missing_token() {
        let mut c = config(None);
        c.token_env = "ETF_DASHBOARD_TEST_TOKEN_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(GithubSync::from_env(c), Err(SyncError::MissingToken(_))));
    }

    #[test]
    fn test_commit_message() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(commit_message(now), "ETF data auto-update - 2024-05-06 07:08:09 UTC");
    }
}
