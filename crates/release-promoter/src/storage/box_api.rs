use std::fs::File;
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{BoxSettings, Secret};
use crate::error::{Error, Result};
use crate::storage::{ApiError, FolderHandle, StorageService, UploadedFile};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    entries: Vec<UploadedFile>,
}

/// Box content API client authenticated with a client-credentials token for
/// an enterprise subject.
pub struct BoxClient {
    api_url: String,
    upload_url: String,
    token: Secret,
    http: Client,
}

impl BoxClient {
    pub fn with_token(
        api_url: &str,
        upload_url: &str,
        token: Secret,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            upload_url: upload_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    /// Exchange the app credentials for an access token and build a client.
    pub fn connect(cfg: &BoxSettings, timeout: Option<Duration>) -> Result<Self> {
        let token = request_token(cfg, timeout)?;
        info!(subject = %cfg.subject_id, "box session established");
        Self::with_token(&cfg.api_url, &cfg.upload_url, token, timeout)
    }

    fn send(
        &self,
        req: reqwest::blocking::RequestBuilder,
        what: &str,
    ) -> std::result::Result<Response, ApiError> {
        let res = req
            .bearer_auth(self.token.expose())
            .send()
            .map_err(|e| ApiError::transport(format!("{what} failed: {e}")))?;
        if res.status().is_success() {
            return Ok(res);
        }
        Err(api_error(res, what))
    }
}

pub fn request_token(cfg: &BoxSettings, timeout: Option<Duration>) -> Result<Secret> {
    let http = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
    let form = [
        ("client_id", cfg.client_id.as_str()),
        ("client_secret", cfg.client_secret.expose()),
        ("grant_type", "client_credentials"),
        ("box_subject_type", "enterprise"),
        ("box_subject_id", cfg.subject_id.as_str()),
    ];
    let res = http
        .post(&cfg.token_url)
        .form(&form)
        .send()
        .map_err(|e| Error::msg(format!("token request failed: {e}")))?;
    if !res.status().is_success() {
        let err = api_error(res, "token request");
        return Err(Error::msg(format!("box authentication failed: {err}")));
    }
    let body: TokenResponse = res
        .json()
        .map_err(|e| Error::msg(format!("token response is malformed: {e}")))?;
    if body.access_token.is_empty() {
        return Err(Error::msg("token response carried an empty access_token"));
    }
    Ok(Secret::new(body.access_token))
}

/// Box error bodies look like `{"type":"error","status":409,"code":"...",
/// "message":"...","context_info":{"conflicts":[{"id":"..."}]}}`; file
/// conflicts put a single object under `conflicts` instead of a list.
fn api_error(res: Response, what: &str) -> ApiError {
    let status = res.status().as_u16();
    let body: serde_json::Value = res.json().unwrap_or(serde_json::Value::Null);
    let code = body
        .get("code")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned);
    let message = body
        .get("message")
        .and_then(|v| v.as_str())
        .map(|m| format!("{what} failed: {m}"))
        .unwrap_or_else(|| format!("{what} failed"));
    let conflicts = match body.pointer("/context_info/conflicts") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
            .map(ToOwned::to_owned)
            .collect(),
        Some(obj @ serde_json::Value::Object(_)) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    ApiError {
        status,
        code,
        message,
        conflicts,
    }
}

impl StorageService for BoxClient {
    fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> std::result::Result<FolderHandle, ApiError> {
        debug!(parent = %parent_id, name = %name, "create folder");
        let req = self
            .http
            .post(format!("{}/folders", self.api_url))
            .json(&json!({"name": name, "parent": {"id": parent_id}}));
        let res = self.send(req, "folder create")?;
        res.json()
            .map_err(|e| ApiError::transport(format!("folder create response is malformed: {e}")))
    }

    fn get_folder(&self, id: &str) -> std::result::Result<FolderHandle, ApiError> {
        let req = self.http.get(format!("{}/folders/{}", self.api_url, id));
        let res = self.send(req, "folder get")?;
        res.json()
            .map_err(|e| ApiError::transport(format!("folder get response is malformed: {e}")))
    }

    fn upload_stream(
        &self,
        folder_id: &str,
        name: &str,
        file: File,
    ) -> std::result::Result<UploadedFile, ApiError> {
        let len = file
            .metadata()
            .map_err(|e| ApiError::transport(format!("cannot stat {name}: {e}")))?
            .len();
        let attributes = json!({"name": name, "parent": {"id": folder_id}}).to_string();
        let form = Form::new().text("attributes", attributes).part(
            "file",
            Part::reader_with_length(file, len).file_name(name.to_string()),
        );
        let req = self
            .http
            .post(format!("{}/files/content", self.upload_url))
            .multipart(form);
        let res = self.send(req, "file upload")?;
        let body: UploadResponse = res
            .json()
            .map_err(|e| ApiError::transport(format!("upload response is malformed: {e}")))?;
        body.entries
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::transport("upload response listed no files"))
    }
}
