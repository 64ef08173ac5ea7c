use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Outbound mail for the auth flows. Delivery is an external collaborator;
/// this development implementation spools one line per message so the reset
/// flow can be exercised without an SMTP relay.
#[derive(Clone)]
pub struct Mailer {
    spool: PathBuf,
}

/// The messages the auth core sends.
pub enum OutboundMessage<'a> {
    PasswordReset { token: &'a str },
    PasswordChanged,
}

impl Default for Mailer {
    fn default() -> Self {
        Self::spooling_to("data/outbox.log")
    }
}

impl Mailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spooling_to(path: impl AsRef<Path>) -> Self {
        Self {
            spool: path.as_ref().to_path_buf(),
        }
    }

    pub fn send(&self, to: &str, message: OutboundMessage<'_>) -> std::io::Result<()> {
        let body = match message {
            OutboundMessage::PasswordReset { token } => {
                format!("kind=password-reset token={}", token)
            }
            OutboundMessage::PasswordChanged => "kind=password-changed".to_string(),
        };

        if let Some(dir) = self.spool.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut spool = OpenOptions::new().create(true).append(true).open(&self.spool)?;
        writeln!(spool, "{} to={} {}", Utc::now().to_rfc3339(), to, body)
    }
}
