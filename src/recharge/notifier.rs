//! Status webhook to the admin panel
//!
//! `POST <url>` with the JSON [`StatusPayload`] as body and two headers:
//! - `X-Timestamp`: unix seconds
//! - `X-Signature`: hex HMAC-SHA256 of `body ++ timestamp` keyed by the shared secret
//!
//! Delivery is best effort. The outcome is returned for logging and never
//! turned into an error.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use sha2::Sha256;

use super::types::StatusPayload;

pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyResult {
    pub ok: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl NotifyResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, payload: &StatusPayload) -> NotifyResult;
}

/// Hex HMAC-SHA256 over `body` followed by `timestamp`
pub fn sign(secret: &[u8], body: &[u8], timestamp: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)?;
    mac.update(body);
    mac.update(timestamp.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
}

impl WebhookNotifier {
    /// Missing URL or secret disables delivery
    pub fn new(
        url: Option<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.is_empty()),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() && self.secret.is_some()
    }
}

#[async_trait]
impl StatusNotifier for WebhookNotifier {
    async fn notify(&self, payload: &StatusPayload) -> NotifyResult {
        let (Some(url), Some(secret)) = (&self.url, &self.secret) else {
            return NotifyResult::failed("webhook not configured");
        };

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return NotifyResult::failed(e.to_string()),
        };
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = match sign(secret.as_bytes(), &body, &timestamp) {
            Ok(signature) => signature,
            Err(e) => return NotifyResult::failed(e.to_string()),
        };

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_TIMESTAMP, &timestamp)
            .header(HEADER_SIGNATURE, signature)
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                NotifyResult {
                    ok: status.is_success(),
                    status: Some(status.as_u16()),
                    error: (!status.is_success()).then(|| format!("HTTP {}", status)),
                }
            }
            Err(e) => NotifyResult::failed(e.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::recharge::types::WebhookStatus;

    fn payload() -> StatusPayload {
        StatusPayload {
            recharge_id: "r-1".into(),
            user_id: None,
            phone_number: "01711000000".into(),
            operator: "GP".into(),
            amount: 50,
            transaction_id: None,
            updated_source: StatusPayload::SOURCE.into(),
            status: WebhookStatus::Pending,
            is_success: 0,
            retry_count: 0,
            message: None,
        }
    }

    #[test]
    fn test_signature_matches_hmac_sha256() {
        // RFC 4231 test case 2, message split between body and timestamp
        let signature = sign(b"Jefe", b"what do ya want ", "for nothing?").unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signature_depends_on_timestamp() {
        let a = sign(b"secret", b"{}", "1700000000").unwrap();
        let b = sign(b"secret", b"{}", "1700000001").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_unconfigured_webhook_is_skipped() {
        let notifier = WebhookNotifier::new(None, Some("s".into()), DEFAULT_TIMEOUT).unwrap();
        assert!(!notifier.is_configured());

        let result = notifier.notify(&payload()).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("webhook not configured"));

        let empty_secret = WebhookNotifier::new(
            Some("http://127.0.0.1:1/hook".into()),
            Some(String::new()),
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert!(!empty_secret.is_configured());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_failure() {
        let notifier = WebhookNotifier::new(
            Some("http://127.0.0.1:1/hook".into()),
            Some("secret".into()),
            Duration::from_secs(2),
        )
        .unwrap();

        let result = notifier.notify(&payload()).await;
        assert!(!result.ok);
        assert!(result.status.is_none());
        assert!(result.error.is_some());
    }
}
