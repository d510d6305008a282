//! Remote scanning endpoint backend (multipart upload, JSON reply).

use super::session::SessionCookie;
use super::{RecognitionError, RecognitionService, ScanImage};
use reqwest::header::{COOKIE, SET_COOKIE};
use serde_json::Value;
use tracing::{debug, info};

pub struct RemoteScanService {
    url: String,
    client: reqwest::Client,
    cookie: SessionCookie,
}

impl RemoteScanService {
    pub fn new(client: reqwest::Client, url: impl Into<String>, cookie: SessionCookie) -> Self {
        Self {
            url: url.into(),
            client,
            cookie,
        }
    }
}

#[async_trait::async_trait]
impl RecognitionService for RemoteScanService {
    fn name(&self) -> &str {
        "remote"
    }

    async fn recognize(&self, image: &ScanImage) -> Result<Value, RecognitionError> {
        use reqwest::multipart::{Form, Part};

        info!(
            "RemoteScanService: uploading {} ({} bytes, {})",
            image.filename,
            image.data.len(),
            image.mime_type
        );

        let part = Part::bytes(image.data.clone())
            .file_name(image.filename.clone())
            .mime_str(&image.mime_type)?;
        let form = Form::new().part("file", part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(cookie) = self.cookie.get() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;

        if let Some(cookie) = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
        {
            self.cookie.set(cookie);
        }

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RecognitionError::Service {
                status: status.as_u16(),
                message: error_message(status.as_u16(), &body),
            });
        }

        debug!("RemoteScanService: response ({} bytes)", body.len());
        Ok(parse_body(&body))
    }
}

/// Success bodies that are empty or not JSON count as an empty object.
fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// User-facing message for a failed call: JSON `message`/`error`, else the
/// start of the body, else the status.
fn error_message(status: u16, body: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = ["message", "error"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
        {
            return msg.to_string();
        }
    }
    if body.trim().is_empty() {
        return format!("Erreur {}", status);
    }
    body.chars().take(200).collect()
}
