//! Kiosk session state machine.
//!
//! [`SessionController::handle`] is the only way the session moves. It never
//! touches the camera, the network or the disk; it returns [`Effect`]s that
//! the driver carries out and reports back as further [`Event`]s.

use facegate_core::EncodingStore;
use facegate_hw::Frame;
use std::fmt;
use std::sync::Arc;

use crate::directory::Directory;
use crate::fallback::{Delivery, IssuedCode};
use crate::verification::{ExitReason, LoopExit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Claim,
    Verifying,
    OfferFallback,
    IssuingCode,
    AwaitingCode,
    Menu,
    AmountEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionIntent {
    Withdrawal,
    Deposit,
}

impl fmt::Display for TransactionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionIntent::Withdrawal => f.write_str("Withdrawal"),
            TransactionIntent::Deposit => f.write_str("Deposit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Face,
    Code,
}

/// Everything known about the current user. Dropped on every return to
/// [`Screen::Claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub identity: String,
    pub contact: Option<String>,
    pub issued: Option<IssuedCode>,
    pub intent: Option<TransactionIntent>,
    pub authenticated: Option<AuthMethod>,
}

#[derive(Debug)]
pub enum Event {
    Claim(String),
    VerificationFinished(LoopExit),
    CameraUnavailable(String),
    AcceptFallback,
    DeclineFallback,
    CodeIssued(IssuedCode),
    CodeDeliveryFailed(String),
    CodeEntered(String),
    ChooseIntent(TransactionIntent),
    AmountEntered(String),
    Back,
    EndSession,
}

#[derive(Debug)]
pub enum Effect {
    StartVerification { identity: String },
    RecordFailure { identity: String, frame: Option<Frame> },
    IssueCode { contact: String },
    Notice(String),
}

pub struct SessionController {
    store: Arc<EncodingStore>,
    directory: Arc<Directory>,
    screen: Screen,
    state: Option<SessionState>,
}

impl SessionController {
    pub fn new(store: Arc<EncodingStore>, directory: Arc<Directory>) -> Self {
        Self {
            store,
            directory,
            screen: Screen::Claim,
            state: None,
        }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let from = self.screen;
        let effects = match (self.screen, event) {
            (_, Event::EndSession) if from != Screen::Claim => {
                self.reset();
                vec![notice("Session ended.")]
            }
            (Screen::Claim, Event::Claim(name)) => self.on_claim(&name),
            (Screen::Verifying, Event::VerificationFinished(exit)) => self.on_verified(exit),
            (Screen::Verifying, Event::CameraUnavailable(reason)) => {
                self.reset();
                vec![notice(format!("Camera unavailable: {reason}"))]
            }
            (Screen::OfferFallback, Event::AcceptFallback) => self.on_accept_fallback(),
            (Screen::OfferFallback, Event::DeclineFallback) => self.deny(),
            (Screen::IssuingCode, Event::CodeIssued(issued)) => self.on_code_issued(issued),
            (Screen::IssuingCode, Event::CodeDeliveryFailed(reason)) => {
                let mut effects = vec![notice(format!("Could not send the code: {reason}"))];
                effects.extend(self.deny());
                effects
            }
            (Screen::AwaitingCode, Event::CodeEntered(input)) => self.on_code_entered(&input),
            (Screen::AwaitingCode, Event::DeclineFallback) => self.deny(),
            (Screen::Menu, Event::ChooseIntent(intent)) => {
                if let Some(state) = self.state.as_mut() {
                    state.intent = Some(intent);
                }
                self.screen = Screen::AmountEntry;
                vec![notice(format!("{intent}: enter the amount."))]
            }
            (Screen::AmountEntry, Event::AmountEntered(input)) => self.on_amount(&input),
            (Screen::AmountEntry, Event::Back) => self.enter_menu(),
            (screen, event) => {
                tracing::debug!(?screen, ?event, "event ignored on this screen");
                Vec::new()
            }
        };
        if self.screen != from {
            tracing::debug!(from = ?from, to = ?self.screen, "screen changed");
        }
        effects
    }

    fn on_claim(&mut self, input: &str) -> Vec<Effect> {
        let name = input.trim();
        if name.is_empty() {
            return vec![notice("Please enter your name.")];
        }
        if !self.store.contains(name) {
            let msg = if self.directory.lookup(name).is_some() {
                format!("'{name}' is registered but not in the face model. Run the update tool first.")
            } else {
                format!("User '{name}' not found. Please register first.")
            };
            tracing::info!(identity = name, "claim rejected");
            return vec![notice(msg)];
        }

        self.state = Some(SessionState {
            identity: name.to_string(),
            contact: self.directory.lookup(name),
            issued: None,
            intent: None,
            authenticated: None,
        });
        self.screen = Screen::Verifying;
        tracing::info!(identity = name, "claim accepted");
        vec![
            notice(format!("Hello {name}, look at the camera.")),
            Effect::StartVerification {
                identity: name.to_string(),
            },
        ]
    }

    fn on_verified(&mut self, exit: LoopExit) -> Vec<Effect> {
        let verdict = exit.outcome().map_or("cancelled", |o| o.label());
        tracing::info!(identity = %exit.identity, verdict, "verification finished");
        let Some(state) = self.state.as_mut() else {
            return self.reset_with("Session lost.");
        };
        match exit.reason {
            ExitReason::Accepted { .. } => {
                state.authenticated = Some(AuthMethod::Face);
                let identity = state.identity.clone();
                let mut effects = vec![notice(format!("Welcome, {identity}."))];
                effects.extend(self.enter_menu());
                effects
            }
            ExitReason::TimedOut | ExitReason::Cancelled => {
                let identity = state.identity.clone();
                let contact = state.contact.clone();
                let mut effects = vec![Effect::RecordFailure {
                    identity,
                    frame: exit.last_frame,
                }];
                match contact {
                    Some(contact) => {
                        self.screen = Screen::OfferFallback;
                        effects.push(notice(format!(
                            "Face verification failed. Send a verification code to {contact}? (y/n)"
                        )));
                    }
                    None => effects.extend(self.deny()),
                }
                effects
            }
        }
    }

    fn on_accept_fallback(&mut self) -> Vec<Effect> {
        match self.state.as_ref().and_then(|s| s.contact.clone()) {
            Some(contact) => {
                self.screen = Screen::IssuingCode;
                vec![Effect::IssueCode { contact }]
            }
            None => self.deny(),
        }
    }

    fn on_code_issued(&mut self, issued: IssuedCode) -> Vec<Effect> {
        let Some(state) = self.state.as_mut() else {
            return self.reset_with("Session lost.");
        };
        let msg = match &issued.delivery {
            Delivery::Simulated => format!("SIMULATED: verification code is {}", issued.code),
            Delivery::Delivered { .. } => match &state.contact {
                Some(contact) => format!("A verification code was sent to {contact}."),
                None => "A verification code was sent.".to_string(),
            },
        };
        state.issued = Some(issued);
        self.screen = Screen::AwaitingCode;
        vec![notice(msg), notice("Enter the 6-digit code.")]
    }

    fn on_code_entered(&mut self, input: &str) -> Vec<Effect> {
        if input.trim().is_empty() {
            return vec![notice("Please enter the code.")];
        }
        let Some(state) = self.state.as_mut() else {
            return self.reset_with("Session lost.");
        };
        let verified = state
            .issued
            .as_ref()
            .is_some_and(|issued| crate::fallback::verify_code(input, issued));
        if !verified {
            tracing::warn!(identity = %state.identity, "incorrect verification code");
            return vec![notice("Incorrect code. Please try again.")];
        }
        state.authenticated = Some(AuthMethod::Code);
        tracing::info!(identity = %state.identity, "verification code accepted");
        let mut effects = vec![notice("Code verified.")];
        effects.extend(self.enter_menu());
        effects
    }

    fn on_amount(&mut self, input: &str) -> Vec<Effect> {
        let amount = match input.trim().parse::<u64>() {
            Ok(amount) if amount > 0 => amount,
            _ => return vec![notice("Please enter a valid positive amount.")],
        };
        let intent = self.state.as_mut().and_then(|s| s.intent.take());
        let Some(intent) = intent else {
            return self.enter_menu();
        };
        tracing::info!(%intent, amount, "transaction confirmed");
        let mut effects = vec![notice(format!("{intent} of {amount} confirmed."))];
        effects.extend(self.enter_menu());
        effects
    }

    /// The menu is reachable only from an authenticated session.
    fn enter_menu(&mut self) -> Vec<Effect> {
        let authenticated = self
            .state
            .as_ref()
            .is_some_and(|s| s.authenticated.is_some());
        if !authenticated {
            tracing::error!(screen = ?self.screen, "menu requested without authentication");
            return self.deny();
        }
        if let Some(state) = self.state.as_mut() {
            state.intent = None;
        }
        self.screen = Screen::Menu;
        vec![notice("1) Withdrawal  2) Deposit  0) End session")]
    }

    fn deny(&mut self) -> Vec<Effect> {
        if let Some(state) = &self.state {
            tracing::warn!(identity = %state.identity, "access denied");
        }
        self.reset_with("Access denied.")
    }

    fn reset_with(&mut self, msg: &str) -> Vec<Effect> {
        self.reset();
        vec![notice(msg)]
    }

    fn reset(&mut self) {
        self.state = None;
        self.screen = Screen::Claim;
    }
}

fn notice(text: impl Into<String>) -> Effect {
    Effect::Notice(text.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{EncodingRecord, Embedding};
    use std::time::Duration;
    use tempfile::TempDir;

    fn controller(tmp: &TempDir) -> SessionController {
        let store = EncodingStore::with_records(
            tmp.path().join("encodings.json"),
            vec![
                EncodingRecord::new("Alice", Embedding::new(vec![0.0, 0.0])),
                EncodingRecord::new("Bob", Embedding::new(vec![1.0, 0.0])),
            ],
        );
        let book = tmp.path().join("phone_numbers.txt");
        std::fs::write(&book, "alice,+15550001\ncarol,+15550003\n").unwrap();
        SessionController::new(Arc::new(store), Arc::new(Directory::load(book)))
    }

    fn exit(reason: ExitReason) -> Event {
        Event::VerificationFinished(LoopExit {
            identity: "Alice".into(),
            reason,
            last_frame: None,
            elapsed: Duration::from_secs(1),
        })
    }

    fn notices(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notice(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_claim_is_validation_notice() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        let effects = ctl.handle(Event::Claim("   ".into()));
        assert_eq!(notices(&effects), vec!["Please enter your name."]);
        assert_eq!(ctl.screen(), Screen::Claim);
        assert!(ctl.state().is_none());
    }

    #[test]
    fn test_claim_lookups_are_case_sensitive_for_store() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);

        let effects = ctl.handle(Event::Claim("alice".into()));
        assert!(notices(&effects)[0].contains("not in the face model"));
        assert_eq!(ctl.screen(), Screen::Claim);

        let effects = ctl.handle(Event::Claim("Zed".into()));
        assert!(notices(&effects)[0].contains("not found"));
    }

    #[test]
    fn test_claim_starts_verification_with_contact() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        let effects = ctl.handle(Event::Claim(" Alice ".into()));
        assert!(effects.iter().any(
            |e| matches!(e, Effect::StartVerification { identity } if identity == "Alice")
        ));
        assert_eq!(ctl.screen(), Screen::Verifying);
        assert_eq!(
            ctl.state().unwrap().contact.as_deref(),
            Some("+15550001")
        );
    }

    #[test]
    fn test_fallback_declined_denies() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        ctl.handle(Event::Claim("Alice".into()));
        ctl.handle(exit(ExitReason::Cancelled));
        assert_eq!(ctl.screen(), Screen::OfferFallback);
        let effects = ctl.handle(Event::DeclineFallback);
        assert_eq!(notices(&effects), vec!["Access denied."]);
        assert_eq!(ctl.screen(), Screen::Claim);
        assert!(ctl.state().is_none());
    }

    #[test]
    fn test_delivery_failure_denies() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        ctl.handle(Event::Claim("Alice".into()));
        ctl.handle(exit(ExitReason::TimedOut));
        let effects = ctl.handle(Event::AcceptFallback);
        assert!(matches!(
            effects.as_slice(),
            [Effect::IssueCode { contact }] if contact == "+15550001"
        ));
        ctl.handle(Event::CodeDeliveryFailed("http 401".into()));
        assert_eq!(ctl.screen(), Screen::Claim);
        assert!(ctl.state().is_none());
    }

    #[test]
    fn test_camera_unavailable_returns_to_claim() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        ctl.handle(Event::Claim("Alice".into()));
        let effects = ctl.handle(Event::CameraUnavailable("device busy".into()));
        assert!(notices(&effects)[0].starts_with("Camera unavailable"));
        assert_eq!(ctl.screen(), Screen::Claim);
        assert!(ctl.state().is_none());
    }

    #[test]
    fn test_amount_validation() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        ctl.handle(Event::Claim("Alice".into()));
        ctl.handle(exit(ExitReason::Accepted { distance: 0.3 }));
        ctl.handle(Event::ChooseIntent(TransactionIntent::Withdrawal));
        assert_eq!(ctl.screen(), Screen::AmountEntry);

        for bad in ["", "abc", "0", "-5", "12.5"] {
            let effects = ctl.handle(Event::AmountEntered(bad.into()));
            assert_eq!(notices(&effects), vec!["Please enter a valid positive amount."]);
            assert_eq!(ctl.screen(), Screen::AmountEntry);
        }

        let effects = ctl.handle(Event::AmountEntered("250".into()));
        assert_eq!(notices(&effects)[0], "Withdrawal of 250 confirmed.");
        assert_eq!(ctl.screen(), Screen::Menu);
        assert!(ctl.state().unwrap().intent.is_none());
    }

    #[test]
    fn test_events_out_of_place_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        assert!(ctl.handle(Event::ChooseIntent(TransactionIntent::Deposit)).is_empty());
        assert!(ctl.handle(Event::CodeEntered("123456".into())).is_empty());
        assert!(ctl.handle(Event::EndSession).is_empty());
        assert_eq!(ctl.screen(), Screen::Claim);
    }

    #[test]
    fn test_end_session_clears_state() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(&tmp);
        ctl.handle(Event::Claim("Alice".into()));
        ctl.handle(exit(ExitReason::Accepted { distance: 0.3 }));
        assert_eq!(ctl.screen(), Screen::Menu);
        ctl.handle(Event::EndSession);
        assert_eq!(ctl.screen(), Screen::Claim);
        assert!(ctl.state().is_none());
    }
}
