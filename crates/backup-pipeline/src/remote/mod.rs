use std::io::Read;
use std::time::Duration;

use serde::Deserialize;

use crate::collab::RemoteBackup;
use crate::config::{RemoteSection, resolve_required_string_field, resolve_string_field};
use crate::error::{Error, Result};
use crate::outcome::RemoteOutcome;
use crate::util::sanitize_remote_text;

const MAX_REMOTE_DETAIL_CHARS: usize = 512;

/// Remote archive service over HTTP.
///
/// `PUT {base}/v1/archives/backup` uploads the artifact,
/// `GET {base}/v1/archives/usage` answers `{"usedSpace": n}`.
pub struct HttpRemote {
    base: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDoc {
    used_space: u64,
}

impl HttpRemote {
    pub fn from_config(cfg: &RemoteSection) -> Result<Self> {
        let base = resolve_required_string_field(
            "remote.base_url",
            Some(cfg.base_url.as_str()),
            cfg.base_url_env.as_deref(),
        )?;
        let token = resolve_string_field(cfg.token.as_deref(), cfg.token_env.as_deref());
        Self::new(&base, token, Duration::from_secs(cfg.timeout_secs.max(1)))
    }

    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn authorize(
        &self,
        req: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

fn send_failure<T>(e: reqwest::Error) -> RemoteOutcome<T> {
    let detail = sanitize_remote_text(&e.to_string(), MAX_REMOTE_DETAIL_CHARS);
    if e.is_builder() {
        // The request could never be sent; retrying won't change that.
        RemoteOutcome::AppError(format!("invalid request: {detail}"))
    } else {
        RemoteOutcome::NetworkError(detail)
    }
}

fn status_failure<T>(res: reqwest::blocking::Response) -> RemoteOutcome<T> {
    let code = res.status().as_u16();
    let body = res.text().unwrap_or_default();
    RemoteOutcome::StatusError(code, sanitize_remote_text(&body, MAX_REMOTE_DETAIL_CHARS))
}

impl RemoteBackup for HttpRemote {
    fn upload(&self, stream: &mut dyn Read, len: u64) -> RemoteOutcome<()> {
        let mut body = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        if let Err(e) = stream.take(len).read_to_end(&mut body) {
            return RemoteOutcome::NetworkError(format!("failed to read artifact stream: {e}"));
        }
        if body.len() as u64 != len {
            return RemoteOutcome::AppError(format!(
                "artifact stream ended after {} of {len} bytes",
                body.len()
            ));
        }

        let req = self
            .client
            .put(self.url("v1/archives/backup"))
            .body(body);
        let res = match self.authorize(req).send() {
            Ok(r) => r,
            Err(e) => return send_failure(e),
        };
        if !res.status().is_success() {
            return status_failure(res);
        }
        tracing::debug!(bytes = len, "artifact uploaded");
        RemoteOutcome::Success(())
    }

    fn query_used_space(&self) -> RemoteOutcome<u64> {
        let req = self.client.get(self.url("v1/archives/usage"));
        let res = match self.authorize(req).send() {
            Ok(r) => r,
            Err(e) => return send_failure(e),
        };
        if !res.status().is_success() {
            return status_failure(res);
        }
        let raw = match res.text() {
            Ok(t) => t,
            Err(e) => return send_failure(e),
        };
        match serde_json::from_str::<UsageDoc>(&raw) {
            Ok(doc) => RemoteOutcome::Success(doc.used_space),
            Err(e) => RemoteOutcome::AppError(format!(
                "undecodable usage response: {e}: {}",
                sanitize_remote_text(&raw, MAX_REMOTE_DETAIL_CHARS)
            )),
        }
    }
}
