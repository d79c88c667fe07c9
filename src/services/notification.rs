//! "Your download is ready" notifications.

use crate::errors::{PipelineError, PipelineResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const ARCHIVE_READY_SUBJECT: &str = "Your photos download is ready!";

/// Everything a client needs to fetch a finished archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReady {
    pub to_name: String,
    pub to_email: String,
    pub album_name: String,
    pub download_url: String,
    pub expiration_days: i64,
}

impl ArchiveReady {
    pub fn html_body(&self) -> String {
        format!(
            "<h1>Your photo album is ready!</h1>\n\
             <p>Hello {}! The photos download you requested is now ready. \
             You can click the button below to download the album '{}' as a ZIP \
             file containing your photos. This link will expire in {} days.</p>\n\
             <a href=\"{}\">Download Album</a>\n",
            escape_html(&self.to_name),
            escape_html(&self.album_name),
            self.expiration_days,
            escape_html(&self.download_url),
        )
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &ArchiveReady) -> PipelineResult<()>;
}

/// Sends e-mail through the Resend HTTP API.
pub struct ResendNotifier {
    client: Client,
    api_key: String,
    from_name: String,
    from_email: String,
}

impl ResendNotifier {
    pub fn new(
        api_key: impl Into<String>,
        from_name: impl Into<String>,
        from_email: impl Into<String>,
    ) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Config(format!("building http client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            from_name: from_name.into(),
            from_email: from_email.into(),
        })
    }

    fn build_payload(&self, message: &ArchiveReady) -> serde_json::Value {
        json!({
            "from": format!("{} <{}>", self.from_name, self.from_email),
            "to": [format!("{} <{}>", message.to_name, message.to_email)],
            "subject": ARCHIVE_READY_SUBJECT,
            "html": message.html_body(),
        })
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(&self, message: &ArchiveReady) -> PipelineResult<()> {
        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(message))
            .send()
            .await
            .map_err(|e| PipelineError::Notify(format!("resend request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(email = %message.to_email, "notification accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "resend rejected notification");
        Err(PipelineError::Notify(format!("resend returned {status}: {body}")))
    }
}

/// Logs notifications instead of sending them. Used when no e-mail API key
/// is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &ArchiveReady) -> PipelineResult<()> {
        info!(
            to = %message.to_email,
            album = %message.album_name,
            download_url = %message.download_url,
            "archive ready (e-mail delivery disabled)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ArchiveReady {
        ArchiveReady {
            to_name: "Casey <3".into(),
            to_email: "casey@example.com".into(),
            album_name: "Spring Shoot".into(),
            download_url: "http://localhost:3000/client/downloads/Spring-Shoot-7.zip".into(),
            expiration_days: 7,
        }
    }

    #[test]
    fn body_names_album_link_and_retention() {
        let body = message().html_body();
        assert!(body.contains("'Spring Shoot'"));
        assert!(body.contains("href=\"http://localhost:3000/client/downloads/Spring-Shoot-7.zip\""));
        assert!(body.contains("expire in 7 days"));
        assert!(body.contains("Casey &lt;3"));
    }

    #[test]
    fn resend_payload_shape() {
        let notifier = ResendNotifier::new("key", "Studio", "noreply@localhost").unwrap();
        let payload = notifier.build_payload(&message());
        assert_eq!(payload["subject"], ARCHIVE_READY_SUBJECT);
        assert_eq!(payload["from"], "Studio <noreply@localhost>");
        assert_eq!(payload["to"][0], "Casey <3 <casey@example.com>");
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        LogNotifier.send(&message()).await.unwrap();
    }
}
