//! Local delivery courier (C5): hand a message off to an external MDA
//! (procmail, maildrop, ...) once per recipient.

use std::path::PathBuf;
use std::time::Duration;

use mailcore_common::envelope;
use mailcore_tracing::traced;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

/// `sysexits.h` `EX_TEMPFAIL`: the LDA is asking for a retry, not a bounce.
const EX_TEMPFAIL: i32 = 75;

const SANITIZE_CHARS: &[char] = &[
    '/', ';', '"', '\'', '\\', '|', '*', '&', '$', '%', '(', ')', '[', ']', '{', '}', '`', '!',
];

#[derive(Debug, Clone)]
pub struct LocalCourierConfig {
    /// Path to the external MDA binary.
    pub command: PathBuf,
    /// Argument template; each element may contain the substitution
    /// tokens `%from%`, `%from_user%`, `%from_domain%`, `%to%`,
    /// `%to_user%`, `%to_domain%`.
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for LocalCourierConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/bin/procmail"),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Invokes an external MDA for local mailbox delivery.
#[derive(Debug, Clone)]
pub struct LocalCourier {
    config: LocalCourierConfig,
}

impl LocalCourier {
    #[must_use]
    pub const fn new(config: LocalCourierConfig) -> Self {
        Self { config }
    }

    /// Delivers `data` to `to` via the configured external command.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Temporary`] on timeout or `EX_TEMPFAIL`
    /// exit, [`DeliveryError::Permanent`] on any other non-zero exit, or
    /// [`DeliveryError::System`] if the command cannot be spawned at all.
    #[traced]
    pub async fn deliver(&self, from: &str, to: &str, data: &[u8]) -> Result<(), DeliveryError> {
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| substitute(arg, from, to))
            .collect();

        let body = normalize_crlf(data);

        let run = async {
            let mut child = Command::new(&self.config.command)
                .args(&args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| DeliveryError::System(SystemError::Internal(format!(
                    "failed to spawn local courier: {e}"
                ))))?;

            let mut stdin = child.stdin.take().ok_or_else(|| {
                DeliveryError::System(SystemError::Internal("local courier stdin missing".into()))
            })?;
            stdin
                .write_all(&body)
                .await
                .map_err(|e| DeliveryError::System(SystemError::Internal(e.to_string())))?;
            drop(stdin);

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| DeliveryError::System(SystemError::Internal(e.to_string())))?;

            classify_exit(&output)
        };

        match timeout(self.config.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Temporary(TemporaryError::Timeout(format!(
                "local courier timed out delivering to {to}"
            )))),
        }
    }
}

fn classify_exit(output: &std::process::Output) -> Result<(), DeliveryError> {
    match output.status.code() {
        Some(0) => Ok(()),
        Some(EX_TEMPFAIL) => Err(DeliveryError::Temporary(TemporaryError::SmtpTemporary(
            combined_output(output),
        ))),
        Some(_) | None => Err(DeliveryError::Permanent(PermanentError::MessageRejected(
            combined_output(output),
        ))),
    }
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "exit {}: {}{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Replaces every substitution token in `template` with the sanitized
/// address component. Tokens referencing a component that doesn't apply
/// (e.g. `%from_user%` for an empty reverse path) expand to the empty string.
fn substitute(template: &str, from: &str, to: &str) -> String {
    let (from_user, from_domain) = envelope::split(from);
    let (to_user, to_domain) = envelope::split(to);

    template
        .replace("%from_user%", &sanitize(&from_user))
        .replace("%from_domain%", &sanitize(&from_domain))
        .replace("%from%", &sanitize(from))
        .replace("%to_user%", &sanitize(&to_user))
        .replace("%to_domain%", &sanitize(&to_domain))
        .replace("%to%", &sanitize(to))
}

/// Strips whitespace, control characters, and shell/path metacharacters.
/// The result is only ever used as a command-line argument, never
/// interpreted by a shell, but we sanitize anyway as defense in depth.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control() && !SANITIZE_CHARS.contains(c))
        .collect()
}

/// Normalizes line endings to CRLF for the MDA's stdin.
fn normalize_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' if data.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(b"\r\n");
                i += 2;
            }
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                i += 1;
            }
            b'\n' => {
                out.extend_from_slice(b"\r\n");
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}
