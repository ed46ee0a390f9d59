//! Motion alert notifications
//!
//! A rate limiter in front of an opaque alert transport. The production
//! transport submits a fixed email over SMTPS with credentials looked up in
//! the user's netrc file; transport failures are logged and never propagate
//! into the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::error::{AppError, Result};

const ALERT_SUBJECT: &str = "pi-client alert";
const ALERT_BODY: &str = "Motion detected on rpi4-1.\n";

/// Opaque "send alert" capability.
pub trait AlertTransport: Send + Sync {
    fn send_alert(&self) -> Result<()>;
}

/// Rate limiter in front of the alert transport: two successive emits are at
/// least `suppress` apart.
pub struct NotificationLimiter {
    transport: Arc<dyn AlertTransport>,
    suppress: Duration,
    last_emit: Option<Instant>,
}

impl NotificationLimiter {
    pub fn new(transport: Arc<dyn AlertTransport>, suppress: Duration) -> Self {
        Self {
            transport,
            suppress,
            last_emit: None,
        }
    }

    /// Emit an alert unless one was emitted within the suppression window.
    pub fn maybe_notify(&mut self) {
        self.maybe_notify_at(Instant::now());
    }

    fn maybe_notify_at(&mut self, now: Instant) {
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.suppress {
                return;
            }
        }
        self.last_emit = Some(now);

        info!("sending motion notification");
        if let Err(e) = self.transport.send_alert() {
            warn!("motion notification failed: {}", e);
        }
    }
}

/// SMTPS alert submission.
pub struct SmtpAlert {
    host: String,
    from: Mailbox,
    to: Mailbox,
    netrc_path: PathBuf,
}

impl SmtpAlert {
    pub fn from_config(cfg: &NotifyConfig) -> Result<Self> {
        let from = cfg
            .from
            .parse()
            .map_err(|e| AppError::Config(format!("bad sender address {:?}: {}", cfg.from, e)))?;
        let to = cfg
            .to
            .parse()
            .map_err(|e| AppError::Config(format!("bad recipient address {:?}: {}", cfg.to, e)))?;
        let netrc_path = match &cfg.netrc {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| AppError::Config("cannot locate home directory for netrc".into()))?
                .join(".netrc"),
        };
        Ok(Self {
            host: cfg.smtp_host.clone(),
            from,
            to,
            netrc_path,
        })
    }
}

impl AlertTransport for SmtpAlert {
    fn send_alert(&self) -> Result<()> {
        let (login, password) = netrc_credentials(&self.netrc_path, &self.host)?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(ALERT_SUBJECT)
            .body(ALERT_BODY.to_string())
            .map_err(|e| AppError::Notify(format!("failed to build message: {}", e)))?;

        // SMTPS submission (implicit TLS on port 465).
        let mailer = SmtpTransport::relay(&self.host)
            .map_err(|e| AppError::Notify(format!("relay setup failed: {}", e)))?
            .credentials(Credentials::new(login, password))
            .build();

        mailer
            .send(&message)
            .map_err(|e| AppError::Notify(format!("smtp submission failed: {}", e)))?;
        Ok(())
    }
}

/// Transport used when alerts are disabled.
pub struct NullAlert;

impl AlertTransport for NullAlert {
    fn send_alert(&self) -> Result<()> {
        tracing::debug!("alerts disabled, notification dropped");
        Ok(())
    }
}

/// Look up `login`/`password` for a machine in a netrc file. Supports the
/// `machine`/`login`/`password` keywords and a trailing `default` entry.
fn netrc_credentials(path: &Path, machine: &str) -> Result<(String, String)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Notify(format!("cannot read {}: {}", path.display(), e)))?;

    let mut tokens = raw.split_whitespace().peekable();
    let mut in_target = false;
    let mut login = None;
    let mut password = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                if in_target && login.is_some() && password.is_some() {
                    break;
                }
                in_target = tokens.next() == Some(machine);
                if in_target {
                    login = None;
                    password = None;
                }
            }
            "default" => {
                if login.is_none() || password.is_none() {
                    in_target = true;
                    login = None;
                    password = None;
                }
            }
            "login" if in_target => login = tokens.next().map(str::to_string),
            "password" if in_target => password = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    match (login, password) {
        (Some(login), Some(password)) => Ok((login, password)),
        _ => Err(AppError::Notify(format!(
            "no credentials for {} in {}",
            machine,
            path.display()
        ))),
    }
}
