//! Google Sheets append client authorised with a service-account key.
//!
//! Token flow: sign an RS256 JWT assertion with the key's private key, trade it
//! at the key's `token_uri` for a bearer token, reuse that token until a minute
//! before it expires.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ConfigError, SheetsError};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
pub const DEFAULT_WORKSHEET: &str = "conversations";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Anything that can take one spreadsheet row.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn append_row(&self, row: Vec<String>) -> Result<(), SheetsError>;
}

/// The fields of a service-account JSON key that the token flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::CredentialsMissing(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialsInvalid {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::CredentialsInvalid {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }
}

/// Extract the spreadsheet id from a `https://docs.google.com/spreadsheets/d/<id>/...` URL.
pub fn spreadsheet_id_from_url(url: &str) -> Option<String> {
    let re = Regex::new(r"/spreadsheets/d/([A-Za-z0-9_-]+)").ok()?;
    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Serialize)]
struct AppendBody<'a> {
    values: [&'a [String]; 1],
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Appends rows to one worksheet of one spreadsheet.
pub struct SheetsClient {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    spreadsheet_id: String,
    worksheet: String,
    token_uri: String,
    api_base: String,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl SheetsClient {
    pub fn new(
        key: ServiceAccountKey,
        spreadsheet_id: impl Into<String>,
        worksheet: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            ConfigError::CredentialsInvalid {
                path: key.client_email.clone(),
                detail: e.to_string(),
            }
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Ok(Self {
            token_uri: key.token_uri.clone(),
            key,
            encoding_key,
            spreadsheet_id: spreadsheet_id.into(),
            worksheet: worksheet.into(),
            api_base: SHEETS_API_BASE.to_string(),
            client,
            token: Mutex::new(None),
        })
    }

    /// Build from a credentials file path and the spreadsheet URL.
    pub fn from_config(
        creds_path: &Path,
        sheet_url: Option<&str>,
        worksheet: &str,
    ) -> Result<Self, ConfigError> {
        let key = ServiceAccountKey::from_file(creds_path)?;
        let url = sheet_url
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::SheetUrlMissing)?;
        let id = spreadsheet_id_from_url(url)
            .ok_or_else(|| ConfigError::SheetUrlInvalid(url.to_string()))?;
        Self::new(key, id, worksheet)
    }

    /// Override the token and API hosts.
    pub fn with_endpoints(mut self, token_uri: impl Into<String>, api_base: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    pub fn worksheet(&self) -> &str {
        &self.worksheet
    }

    fn sign_assertion(&self) -> Result<String, SheetsError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| SheetsError::Signing(e.to_string()))
    }

    async fn access_token(&self) -> Result<String, SheetsError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.sign_assertion()?;
        let resp = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SheetsError::Token(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Token(format!("HTTP {status}: {body}")));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SheetsError::Token(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in = token.expires_in, "fetched spreadsheet access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn api_url(&self, segments: &[&str]) -> Result<reqwest::Url, SheetsError> {
        let mut url = reqwest::Url::parse(&self.api_base)
            .map_err(|e| SheetsError::Transport(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SheetsError::Transport(format!("{} cannot be a base URL", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Check that the spreadsheet is reachable and has the configured worksheet.
    pub async fn verify(&self) -> Result<(), SheetsError> {
        let token = self.access_token().await?;
        let mut url = self.api_url(&["v4", "spreadsheets", &self.spreadsheet_id])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SheetsError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Status { status, body });
        }
        let meta: SpreadsheetMeta = resp
            .json()
            .await
            .map_err(|e| SheetsError::Transport(e.to_string()))?;
        if meta.sheets.iter().any(|s| s.properties.title == self.worksheet) {
            Ok(())
        } else {
            Err(SheetsError::Status {
                status: 404,
                body: format!("worksheet '{}' not found", self.worksheet),
            })
        }
    }
}

#[async_trait]
impl RowSink for SheetsClient {
    async fn append_row(&self, row: Vec<String>) -> Result<(), SheetsError> {
        let token = self.access_token().await?;
        let range = format!("{}:append", self.worksheet);
        let mut url = self.api_url(&["v4", "spreadsheets", &self.spreadsheet_id, "values", &range])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&AppendBody { values: [row.as_slice()] })
            .send()
            .await
            .map_err(|e| SheetsError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Status { status, body });
        }
        Ok(())
    }
}
