//! Gated application sender.
//!
//! Gates run in a fixed order and every failure blocks only the current
//! attempt: sending enabled (or dry run), a real PDF attachment, then the
//! per-run cap. Real sends are spaced by a fixed delay.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::{MailEnvelope, MailTransport, TransportReceipt};
use crate::config::ApplyConfig;
use crate::error::{Error, SafetyError, ValidationError};

const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Gates passed; nothing left the process.
    DryRun,
    Sent { receipt: TransportReceipt },
    Failed { diagnostic: String },
}

pub struct Sender {
    transport: Arc<dyn MailTransport>,
    config: ApplyConfig,
    attempts: u32,
    real_sends: u32,
}

impl Sender {
    pub fn new(transport: Arc<dyn MailTransport>, config: ApplyConfig) -> Self {
        Self {
            transport,
            config,
            attempts: 0,
            real_sends: 0,
        }
    }

    /// Attempts counted against the cap so far in this run.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run the gates and, unless `dry_run`, hand the email to the transport.
    pub async fn send(
        &mut self,
        envelope: &MailEnvelope,
        attachment: &Path,
        dry_run: bool,
    ) -> Result<SendOutcome, Error> {
        if !self.config.apply_enabled && !dry_run {
            return Err(SafetyError::SendingDisabled.into());
        }

        let document = load_pdf(attachment).await?;

        if self.attempts >= self.config.max_per_run {
            return Err(SafetyError::RateCapReached {
                max: self.config.max_per_run,
            }
            .into());
        }
        self.attempts += 1;

        if dry_run {
            debug!(to = %envelope.to, "Dry run, not sending");
            return Ok(SendOutcome::DryRun);
        }

        if self.real_sends > 0 && !self.config.send_delay.is_zero() {
            debug!(delay_ms = self.config.send_delay.as_millis() as u64, "Spacing sends");
            tokio::time::sleep(self.config.send_delay).await;
        }
        self.real_sends += 1;

        match self.transport.send_mail(envelope, &document).await {
            Ok(receipt) if receipt.accepted => {
                info!(to = %envelope.to, "Application sent");
                Ok(SendOutcome::Sent { receipt })
            }
            Ok(receipt) => {
                warn!(to = %envelope.to, diagnostic = %receipt.diagnostic, "Transport rejected email");
                Ok(SendOutcome::Failed {
                    diagnostic: receipt.diagnostic,
                })
            }
            Err(e) => {
                warn!(to = %envelope.to, "Send failed: {e}");
                Ok(SendOutcome::Failed {
                    diagnostic: e.to_string(),
                })
            }
        }
    }
}

/// Read the attachment, checking it is a PDF by extension and magic bytes.
async fn load_pdf(path: &Path) -> Result<Vec<u8>, ValidationError> {
    let is_pdf_name = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(ValidationError::AttachmentMissing {
                path: path.to_path_buf(),
            });
        }
    };

    if !is_pdf_name {
        return Err(ValidationError::AttachmentType {
            path: path.to_path_buf(),
            reason: "extension is not .pdf".into(),
        });
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ValidationError::AttachmentType {
            path: path.to_path_buf(),
            reason: "file does not start with %PDF".into(),
        });
    }
    Ok(bytes)
}
