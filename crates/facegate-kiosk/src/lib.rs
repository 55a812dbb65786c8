//! facegate-kiosk: the ATM kiosk session. Face verification with a
//! one-time-code fallback, registration capture and the session state
//! machine that ties them together.

pub mod config;
pub mod directory;
pub mod fallback;
pub mod registration;
pub mod session;
pub mod sink;
pub mod verification;

pub use config::{ChannelConfig, Config};
pub use directory::Directory;
pub use fallback::{FallbackAuthenticator, IssuedCode, NotificationChannel, TwilioChannel};
pub use registration::RegistrationSession;
pub use session::{Effect, Event, Screen, SessionController, TransactionIntent};
pub use sink::{DirectorySink, FailureSink};
pub use verification::{CancelToken, LoopExit, Tick, VerificationLoop, VerifyConfig};
