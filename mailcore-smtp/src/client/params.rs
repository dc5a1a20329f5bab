//! Generic ESMTP parameters attached to a MAIL FROM command (RFC 5321 §3.3).

use std::fmt::{self, Display};

/// A single ESMTP parameter, either a bare flag (`SMTPUTF8`) or a `KEY=VALUE` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Param {
    Flag(String),
    KeyValue(String, String),
}

/// An ordered set of ESMTP parameters to append to a MAIL FROM command.
///
/// # Examples
///
/// ```
/// use mailcore_smtp::client::MailParameters;
///
/// let params = MailParameters::new().with("SIZE", "12345").with_flag("SMTPUTF8");
/// assert_eq!(params.to_string(), "SIZE=12345 SMTPUTF8");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    params: Vec<Param>,
}

impl MailParameters {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no parameters have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Adds a `KEY=VALUE` parameter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(Param::KeyValue(key.into(), value.into()));
        self
    }

    /// Adds a bare flag parameter (no value), e.g. `SMTPUTF8`.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.params.push(Param::Flag(key.into()));
        self
    }

    /// Adds the SIZE parameter (RFC 1870).
    #[must_use]
    pub fn with_size(self, size: usize) -> Self {
        self.with("SIZE", size.to_string())
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for param in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match param {
                Param::Flag(name) => f.write_str(name)?,
                Param::KeyValue(key, value) => write!(f, "{key}={value}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_params_display_as_empty_string() {
        assert!(MailParameters::new().is_empty());
        assert_eq!(MailParameters::new().to_string(), "");
    }

    #[test]
    fn mixed_flags_and_values_join_with_spaces() {
        let params = MailParameters::new()
            .with_size(1000)
            .with("BODY", "8BITMIME")
            .with_flag("SMTPUTF8");

        assert_eq!(params.to_string(), "SIZE=1000 BODY=8BITMIME SMTPUTF8");
        assert!(!params.is_empty());
    }
}
