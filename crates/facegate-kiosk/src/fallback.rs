//! One-time code fallback for users whose face scan failed.
//!
//! Codes are delivered through a [`NotificationChannel`] when one is
//! configured and the contact is in international format; otherwise the
//! code is simulated and shown to the operator instead.

use base64::Engine;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::TwilioConfig;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("delivery rejected with http status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("delivery transport error: {0}")]
    Transport(String),
    #[error("malformed delivery response: {0}")]
    Response(String),
}

/// Outbound message transport. Returns the provider's delivery id.
pub trait NotificationChannel {
    fn send(&self, contact: &str, message: &str) -> Result<String, ChannelError>;
}

/// Twilio Messaging REST API (WhatsApp by default, SMS with an empty prefix).
pub struct TwilioChannel {
    agent: ureq::Agent,
    base_url: String,
    account_sid: String,
    auth_header: String,
    from: String,
    to_prefix: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    sid: String,
}

impl TwilioChannel {
    pub fn new(config: &TwilioConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .timeout_write(Duration::from_secs(10))
            .build();
        let credentials = format!("{}:{}", config.account_sid, config.auth_token);
        Self {
            agent,
            base_url: TWILIO_API_BASE.to_string(),
            account_sid: config.account_sid.clone(),
            auth_header: format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ),
            from: config.from.clone(),
            to_prefix: config.to_prefix.clone(),
        }
    }

    /// Point the channel at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.account_sid
        )
    }
}

impl NotificationChannel for TwilioChannel {
    fn send(&self, contact: &str, message: &str) -> Result<String, ChannelError> {
        let to = format!("{}{contact}", self.to_prefix);
        let result = self
            .agent
            .post(&self.messages_url())
            .set("authorization", &self.auth_header)
            .send_form(&[("From", self.from.as_str()), ("To", to.as_str()), ("Body", message)]);

        match result {
            Ok(resp) => {
                let body: MessageResponse = resp
                    .into_json()
                    .map_err(|e| ChannelError::Response(e.to_string()))?;
                Ok(body.sid)
            }
            Err(ureq::Error::Status(status, resp)) => Err(ChannelError::Rejected {
                status,
                message: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(err)) => Err(ChannelError::Transport(err.to_string())),
        }
    }
}

/// How an issued code reached the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { id: String },
    /// Nothing was sent; the operator is shown the code.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub code: String,
    pub delivery: Delivery,
}

pub struct FallbackAuthenticator {
    channel: Option<Box<dyn NotificationChannel + Send + Sync>>,
}

impl FallbackAuthenticator {
    pub fn new(channel: Option<Box<dyn NotificationChannel + Send + Sync>>) -> Self {
        Self { channel }
    }

    /// No channel: every issue is simulated.
    pub fn simulated() -> Self {
        Self { channel: None }
    }

    /// Generate a fresh code and deliver it to `contact`.
    pub fn issue(&self, contact: &str) -> Result<IssuedCode, ChannelError> {
        self.issue_with(&mut rand::thread_rng(), contact)
    }

    pub fn issue_with<R: Rng>(
        &self,
        rng: &mut R,
        contact: &str,
    ) -> Result<IssuedCode, ChannelError> {
        let code = generate_code(rng);

        let channel = match &self.channel {
            Some(channel) if contact.starts_with('+') => channel,
            _ => {
                tracing::warn!(contact, "code simulated; no channel or contact not in +E.164 form");
                return Ok(IssuedCode {
                    code,
                    delivery: Delivery::Simulated,
                });
            }
        };

        let id = channel.send(contact, &code_message(&code)).map_err(|e| {
            tracing::error!(contact, error = %e, "code delivery failed");
            e
        })?;
        tracing::info!(contact, delivery_id = %id, "code delivered");
        Ok(IssuedCode {
            code,
            delivery: Delivery::Delivered { id },
        })
    }

    pub fn verify(&self, input: &str, issued: &IssuedCode) -> bool {
        verify_code(input, issued)
    }
}

/// Byte-for-byte comparison; no trimming, no expiry, no attempt limit.
pub fn verify_code(input: &str, issued: &IssuedCode) -> bool {
    input == issued.code
}

pub fn generate_code<R: Rng>(rng: &mut R) -> String {
    rng.gen_range(100_000..=999_999u32).to_string()
}

pub fn code_message(code: &str) -> String {
    format!("Your Secure ATM verification code is: {code}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl NotificationChannel for RecordingChannel {
        fn send(&self, contact: &str, message: &str) -> Result<String, ChannelError> {
            if self.fail {
                return Err(ChannelError::Transport("connection refused".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((contact.to_string(), message.to_string()));
            Ok("SM123".to_string())
        }
    }

    #[test]
    fn test_codes_are_six_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let code = generate_code(&mut rng);
            assert_eq!(code.len(), 6);
            let n: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&n));
        }
    }

    #[test]
    fn test_simulated_without_channel() {
        let auth = FallbackAuthenticator::simulated();
        let issued = auth.issue("+15550001").unwrap();
        assert_eq!(issued.delivery, Delivery::Simulated);
        assert!(auth.verify(&issued.code, &issued));
    }

    #[test]
    fn test_simulated_when_contact_lacks_plus() {
        let auth = FallbackAuthenticator::new(Some(Box::new(RecordingChannel::default())));
        let issued = auth.issue("15550001").unwrap();
        assert_eq!(issued.delivery, Delivery::Simulated);
    }

    #[test]
    fn test_delivered_through_channel() {
        let channel = std::sync::Arc::new(RecordingChannel::default());
        struct Shared(std::sync::Arc<RecordingChannel>);
        impl NotificationChannel for Shared {
            fn send(&self, contact: &str, message: &str) -> Result<String, ChannelError> {
                self.0.send(contact, message)
            }
        }

        let auth = FallbackAuthenticator::new(Some(Box::new(Shared(channel.clone()))));
        let issued = auth.issue("+15550001").unwrap();
        assert_eq!(
            issued.delivery,
            Delivery::Delivered {
                id: "SM123".into()
            }
        );
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].0, "+15550001");
        assert_eq!(sent[0].1, code_message(&issued.code));
    }

    #[test]
    fn test_channel_failure_is_an_error() {
        let auth = FallbackAuthenticator::new(Some(Box::new(RecordingChannel {
            fail: true,
            ..Default::default()
        })));
        assert!(matches!(
            auth.issue("+15550001"),
            Err(ChannelError::Transport(_))
        ));
    }

    #[test]
    fn test_verify_is_exact() {
        let auth = FallbackAuthenticator::simulated();
        let issued = IssuedCode {
            code: "482913".into(),
            delivery: Delivery::Simulated,
        };
        assert!(auth.verify("482913", &issued));
        assert!(!auth.verify(" 482913", &issued));
        assert!(!auth.verify("482913\n", &issued));
        assert!(!auth.verify("48291", &issued));
        assert!(!auth.verify("", &issued));
    }

    #[test]
    fn test_twilio_url_and_unreachable_host() {
        let config = TwilioConfig {
            account_sid: "AC42".into(),
            auth_token: "secret".into(),
            from: "whatsapp:+14155238886".into(),
            to_prefix: "whatsapp:".into(),
        };
        let channel = TwilioChannel::new(&config).with_base_url("http://127.0.0.1:9/2010-04-01/");
        assert_eq!(
            channel.messages_url(),
            "http://127.0.0.1:9/2010-04-01/Accounts/AC42/Messages.json"
        );
        assert_eq!(channel.auth_header, "Basic QUM0MjpzZWNyZXQ=");
        assert!(matches!(
            channel.send("+15550001", "hi"),
            Err(ChannelError::Transport(_))
        ));
    }
}
