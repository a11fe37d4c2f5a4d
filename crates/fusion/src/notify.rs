use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::config::MailConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail API returned status {status}: {body}")]
    Api { status: u16, body: String },
}

/// Terminal result communicated to the recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { url: String },
    Failure { message: String },
}

/// Tells the recipient how their job ended. Callers must treat a
/// notification fault as non-fatal; it never changes job state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, email: &str, name: &str, outcome: &Outcome) -> Result<(), NotifyError>;
}

/// Render the HTML body for an outcome
pub fn render_body(name: &str, outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success { url } => format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; background-color: #f9f9f9;">
  <div style="max-width: 600px; margin: 20px auto; background-color: #ffffff; border: 1px solid #dddddd; border-radius: 8px;">
    <div style="background-color: #0078d7; color: #ffffff; padding: 20px; text-align: center;">
      <h1>Your Video is Ready!</h1>
    </div>
    <div style="padding: 20px;">
      <p>Dear {name},</p>
      <p>We're excited to let you know that your requested video is ready. Click the link below to view it:</p>
      <p style="text-align: center;"><a href="{url}" target="_blank">Watch Video</a></p>
      <p>If you have any questions or need further assistance, feel free to reply to this email.</p>
      <p>Thank you for choosing us!</p>
    </div>
  </div>
</body>
</html>"#
        ),
        Outcome::Failure { message } => format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; background-color: #f9f9f9;">
  <div style="max-width: 600px; margin: 20px auto; background-color: #ffffff; border: 1px solid #dddddd; border-radius: 8px;">
    <div style="background-color: #0078d7; color: #ffffff; padding: 20px; text-align: center;">
      <h1>Your Video Status</h1>
    </div>
    <div style="padding: 20px;">
      <p>Dear {name},</p>
      <p>We're disappointed to let you know that your requested video failed to build. See the error below:</p>
      <p style="text-align: center;"><code>{message}</code></p>
      <p>If you have any questions or need further assistance, feel free to reply to this email.</p>
    </div>
  </div>
</body>
</html>"#
        ),
    }
}

#[derive(Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: String,
}

/// Notifier that posts outbound mail to an HTTP mail API
pub struct MailApiNotifier {
    http: reqwest::Client,
    cfg: MailConfig,
}

impl MailApiNotifier {
    pub fn new(cfg: MailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl Notifier for MailApiNotifier {
    async fn notify(&self, email: &str, name: &str, outcome: &Outcome) -> Result<(), NotifyError> {
        let request = MailRequest {
            from: &self.cfg.from,
            to: email,
            subject: &self.cfg.subject,
            html: render_body(name, outcome),
        };

        let response = self
            .http
            .post(&self.cfg.endpoint)
            .bearer_auth(&self.cfg.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Mail API accepted message to {}", email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mail_cfg(endpoint: String) -> MailConfig {
        MailConfig {
            endpoint,
            api_key: "key123".to_string(),
            from: "noreply@example.com".to_string(),
            subject: "Your customized advert".to_string(),
        }
    }

    #[test]
    fn test_success_body_carries_url() {
        let body = render_body(
            "Ada",
            &Outcome::Success {
                url: "https://cdn.example/v.mp4".to_string(),
            },
        );
        assert!(body.contains("Dear Ada"));
        assert!(body.contains("https://cdn.example/v.mp4"));
        assert!(body.contains("Your Video is Ready"));
    }

    #[test]
    fn test_failure_body_carries_message() {
        let body = render_body(
            "Ada",
            &Outcome::Failure {
                message: "stage 1 failed: exit code 1".to_string(),
            },
        );
        assert!(body.contains("Dear Ada"));
        assert!(body.contains("stage 1 failed: exit code 1"));
        assert!(body.contains("failed to build"));
    }

    #[tokio::test]
    async fn test_posts_to_mail_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/send"))
            .and(header("authorization", "Bearer key123"))
            .and(body_partial_json(serde_json::json!({
                "to": "user@example.com",
                "from": "noreply@example.com",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = MailApiNotifier::new(mail_cfg(format!("{}/v1/send", server.uri())));
        notifier
            .notify(
                "user@example.com",
                "User",
                &Outcome::Success {
                    url: "https://cdn.example/v.mp4".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported_not_panicked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let notifier = MailApiNotifier::new(mail_cfg(format!("{}/v1/send", server.uri())));
        let err = notifier
            .notify(
                "user@example.com",
                "User",
                &Outcome::Failure {
                    message: "boom".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Api { status: 503, .. }));
    }
}
