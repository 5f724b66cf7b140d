//! Alert rule evaluation and delivery

pub mod engine;
pub mod mailer;
pub mod rules;

pub use engine::{NotificationEngine, SweepReport};
pub use mailer::{MailError, Mailer, SmtpMailer, SmtpSettings};
pub use rules::{Alert, Evaluation};
