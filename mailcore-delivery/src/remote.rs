//! Outbound SMTP courier (C6): MX resolution, STARTTLS security-level
//! classification, MTA-STS enforcement, and the actual mail transaction
//! against a remote peer.

use std::sync::Arc;
use std::time::Duration;

use mailcore_common::{Domain, envelope, normalize};
use mailcore_smtp::client::{MailParameters, SmtpClient};
use mailcore_spool::{CacheLookup, DomaininfoStore, SecurityLevel, StsCache, StsPolicy};
use mailcore_tracing::traced;
use tokio::time::timeout;

use crate::dns::DnsResolver;
use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

#[derive(Debug, Clone)]
pub struct RemoteCourierConfig {
    /// Domain name this server identifies itself as in EHLO/HELO.
    pub helo_domain: String,
    pub connect_timeout: Duration,
    /// Total wall-clock budget for one MX attempt, connect through QUIT.
    pub total_deadline: Duration,
}

impl Default for RemoteCourierConfig {
    fn default() -> Self {
        Self {
            helo_domain: "localhost".to_string(),
            connect_timeout: Duration::from_secs(60),
            total_deadline: Duration::from_secs(10 * 60),
        }
    }
}

/// Delivers mail to remote MXs, applying STARTTLS opportunistically and
/// refusing downgrades from a previously observed stronger posture.
pub struct RemoteCourier {
    dns: Arc<DnsResolver>,
    sts: Arc<StsCache>,
    domaininfo: Arc<DomaininfoStore>,
    config: RemoteCourierConfig,
}

impl RemoteCourier {
    #[must_use]
    pub const fn new(
        dns: Arc<DnsResolver>,
        sts: Arc<StsCache>,
        domaininfo: Arc<DomaininfoStore>,
        config: RemoteCourierConfig,
    ) -> Self {
        Self {
            dns,
            sts,
            domaininfo,
            config,
        }
    }

    /// Resolves `to`'s domain and attempts delivery against its MXs in
    /// priority order, filtered by MTA-STS if a policy is cached.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Permanent`] on the first permanent
    /// rejection from any MX. Otherwise, if every MX is exhausted without
    /// success, returns the last [`DeliveryError::Temporary`] seen.
    #[traced]
    pub async fn deliver(&self, from: &str, to: &str, data: &[u8]) -> Result<(), DeliveryError> {
        let (_, domain) = envelope::split(to);
        let domain_key = Domain::new(domain.clone());

        let servers = self.dns.resolve_mail_servers(&domain).await?;

        let policy = match self.sts.lookup(&domain_key).await {
            CacheLookup::Fresh(policy) => Some(policy),
            CacheLookup::Expired | CacheLookup::Absent => None,
        };

        let hosts: Vec<String> = servers
            .iter()
            .filter(|s| policy.as_ref().is_none_or(|p| p.mx_is_allowed(&s.host)))
            .map(|s| s.address())
            .collect();

        if hosts.is_empty() {
            return Err(DeliveryError::Temporary(TemporaryError::DnsLookupFailed(
                format!("no MX for {domain} survived MTA-STS filtering"),
            )));
        }

        self.attempt_hosts(&hosts, from, to, data, &domain_key, policy.as_ref())
            .await
    }

    /// Delivers to an explicit host list, skipping MX lookup and MTA-STS
    /// entirely (used for alias `forward via [...]` targets).
    ///
    /// # Errors
    ///
    /// Same disposition as [`Self::deliver`].
    #[traced]
    pub async fn forward(
        &self,
        from: &str,
        to: &str,
        data: &[u8],
        via_hosts: &[String],
    ) -> Result<(), DeliveryError> {
        let (_, domain) = envelope::split(to);
        let domain_key = Domain::new(domain);

        let hosts: Vec<String> = via_hosts
            .iter()
            .map(|h| {
                if h.contains(':') {
                    h.clone()
                } else {
                    format!("{h}:25")
                }
            })
            .collect();

        self.attempt_hosts(&hosts, from, to, data, &domain_key, None)
            .await
    }

    async fn attempt_hosts(
        &self,
        hosts: &[String],
        from: &str,
        to: &str,
        data: &[u8],
        domain: &Domain,
        sts_policy: Option<&StsPolicy>,
    ) -> Result<(), DeliveryError> {
        let mut last_err = None;

        for host in hosts {
            match timeout(
                self.config.total_deadline,
                self.attempt_one(host, from, to, data, domain, sts_policy),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err @ DeliveryError::Permanent(_))) => return Err(err),
                Ok(Err(err)) => last_err = Some(err),
                Err(_) => {
                    last_err = Some(DeliveryError::Temporary(TemporaryError::Timeout(format!(
                        "delivery to {host} exceeded the total deadline"
                    ))));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            DeliveryError::Temporary(TemporaryError::ConnectionFailed(
                "no mail server candidates remained".to_string(),
            ))
        }))
    }

    async fn attempt_one(
        &self,
        host: &str,
        from: &str,
        to: &str,
        data: &[u8],
        domain: &Domain,
        sts_policy: Option<&StsPolicy>,
    ) -> Result<(), DeliveryError> {
        let (mut client, level) = self.connect_and_classify(host).await?;

        if !self
            .domaininfo
            .outgoing_sec_level(domain, level)
            .await
            .map_err(|e| DeliveryError::System(SystemError::SpoolWrite(e.to_string())))?
        {
            return Err(DeliveryError::Temporary(TemporaryError::DowngradeRefused(
                format!("{domain} was previously seen at a stronger TLS level than {level:?}"),
            )));
        }

        if let Some(policy) = sts_policy {
            if policy.mode == mailcore_spool::StsMode::Enforce && level != SecurityLevel::TlsSecure {
                return Err(DeliveryError::Temporary(TemporaryError::StsFetchFailed(
                    format!("{domain} requires MTA-STS enforce but only {level:?} was achieved"),
                )));
            }
        }

        let has_8bitmime = client.extension("8BITMIME").0;
        let has_smtputf8 = client.extension("SMTPUTF8").0;
        let non_ascii = !from.is_ascii() || !to.is_ascii();

        let wire_from = to_wire_address(from, has_smtputf8)?;
        let wire_to = to_wire_address(to, has_smtputf8)?;

        let mut params = MailParameters::new();
        if has_8bitmime {
            params = params.with_flag("BODY=8BITMIME");
        }
        if non_ascii && has_smtputf8 {
            params = params.with_flag("SMTPUTF8");
        }

        let mail_from = if wire_from.is_empty() || wire_from == "<>" {
            String::new()
        } else {
            wire_from
        };

        let mail_response = client
            .mail_from_with_params(&mail_from, &params)
            .await
            .map_err(DeliveryError::from)?;
        if !mail_response.is_success() {
            return Err(classify_reply(mail_response.code, mail_response.message()));
        }

        let rcpt_response = client.rcpt_to(&wire_to).await.map_err(DeliveryError::from)?;
        if !rcpt_response.is_success() {
            return Err(classify_reply(rcpt_response.code, rcpt_response.message()));
        }

        let mut writer = client.data_writer().await.map_err(DeliveryError::from)?;
        writer.write(data).await.map_err(DeliveryError::from)?;
        let data_response = writer.finish().await.map_err(DeliveryError::from)?;
        if !data_response.is_success() {
            return Err(classify_reply(data_response.code, data_response.message()));
        }

        let _ = client.quit().await;

        Ok(())
    }

    /// Connects, negotiates STARTTLS if advertised, and classifies the
    /// resulting security level. Attempts strict certificate verification
    /// first; on a protocol-level STARTTLS rejection the connection stays
    /// plain; on a handshake/verification failure it reconnects and
    /// retries accepting any certificate.
    async fn connect_and_classify(
        &self,
        host: &str,
    ) -> Result<(SmtpClient, SecurityLevel), DeliveryError> {
        let mut client = self.connect_ehlo(host, false).await?;

        if !client.extension("STARTTLS").0 {
            return Ok((client, SecurityLevel::Plain));
        }

        match client.starttls().await {
            Ok(response) if response.is_success() => {
                self.reehlo(&mut client).await?;
                Ok((client, SecurityLevel::TlsSecure))
            }
            Ok(_) => Ok((client, SecurityLevel::Plain)),
            Err(_) => {
                let mut client = self.connect_ehlo(host, true).await?;
                let response = client.starttls().await.map_err(DeliveryError::from)?;
                if !response.is_success() {
                    return Ok((client, SecurityLevel::Plain));
                }
                self.reehlo(&mut client).await?;
                Ok((client, SecurityLevel::TlsInsecure))
            }
        }
    }

    async fn connect_ehlo(
        &self,
        host: &str,
        accept_invalid_certs: bool,
    ) -> Result<SmtpClient, DeliveryError> {
        // `host` is "host:port" for the socket address; the TLS SNI/cert
        // name must be the bare host with no port suffix.
        let server_domain = host.rsplit_once(':').map_or(host, |(h, _)| h);
        let mut client = timeout(
            self.config.connect_timeout,
            SmtpClient::connect(host, server_domain.to_string()),
        )
        .await
        .map_err(|_| {
            DeliveryError::Temporary(TemporaryError::Timeout(format!(
                "connect to {host} timed out"
            )))
        })?
        .map_err(DeliveryError::from)?
        .accept_invalid_certs(accept_invalid_certs);

        client.read_greeting().await.map_err(DeliveryError::from)?;
        client
            .ehlo(&self.config.helo_domain)
            .await
            .map_err(DeliveryError::from)?;

        Ok(client)
    }

    async fn reehlo(&self, client: &mut SmtpClient) -> Result<(), DeliveryError> {
        client
            .ehlo(&self.config.helo_domain)
            .await
            .map_err(DeliveryError::from)?;
        Ok(())
    }
}

/// Converts `addr` to a form safe to put on the wire given whether the
/// peer advertised SMTPUTF8. If the address is ASCII, or the peer
/// supports SMTPUTF8, it's returned unchanged. Otherwise, if only the
/// domain is non-ASCII, the domain is converted to IDNA A-labels;
/// a non-ASCII local part with no SMTPUTF8 support can't be represented.
fn to_wire_address(addr: &str, smtputf8: bool) -> Result<String, DeliveryError> {
    if addr.is_empty() || addr == "<>" || addr.is_ascii() || smtputf8 {
        return Ok(addr.to_string());
    }

    let (user, domain) = envelope::split(addr);
    if !user.is_ascii() {
        return Err(DeliveryError::Permanent(PermanentError::InvalidRecipient(
            format!("{addr} requires SMTPUTF8, which the peer did not advertise"),
        )));
    }

    let ascii_domain = normalize::to_ascii(&domain).map_err(|e| {
        DeliveryError::Permanent(PermanentError::InvalidRecipient(format!(
            "could not convert {domain} to IDNA: {e}"
        )))
    })?;

    Ok(format!("{user}@{ascii_domain}"))
}

fn classify_reply(code: u16, message: String) -> DeliveryError {
    if (500..600).contains(&code) {
        DeliveryError::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
    } else {
        DeliveryError::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_address_passes_through_ascii() {
        assert_eq!(to_wire_address("a@b.com", false).unwrap(), "a@b.com");
    }

    #[test]
    fn wire_address_passes_through_non_ascii_with_smtputf8() {
        assert_eq!(to_wire_address("ál@b.com", true).unwrap(), "ál@b.com");
    }

    #[test]
    fn wire_address_converts_non_ascii_domain_without_smtputf8() {
        let wire = to_wire_address("a@müller.de", false).unwrap();
        assert!(wire.starts_with("a@xn--"));
    }

    #[test]
    fn wire_address_rejects_non_ascii_local_part_without_smtputf8() {
        assert!(to_wire_address("ál@b.com", false).is_err());
    }

    #[test]
    fn classify_reply_splits_on_5xx() {
        assert!(matches!(
            classify_reply(550, "no".into()),
            DeliveryError::Permanent(_)
        ));
        assert!(matches!(
            classify_reply(450, "no".into()),
            DeliveryError::Temporary(_)
        ));
    }
}
