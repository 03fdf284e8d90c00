//! MX resolution for servers chosen by recipient domain.

use async_trait::async_trait;
use std::fmt;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::errors::{SmtpError, SmtpResult};

/// Maps a mail domain to its exchangers, most preferred first.
#[async_trait]
pub trait MxResolver: Send + Sync + fmt::Debug {
    /// Returns exchanger host names ordered by preference.
    async fn lookup_mx(&self, domain: &str) -> SmtpResult<Vec<String>>;
}

/// Resolver backed by the system DNS configuration.
pub struct DnsMxResolver {
    resolver: TokioAsyncResolver,
}

impl DnsMxResolver {
    /// Creates a resolver from `/etc/resolv.conf` or the platform
    /// equivalent.
    pub fn from_system_conf() -> SmtpResult<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| SmtpError::dns("Cannot load system resolver configuration").with_cause(e))?;
        Ok(Self { resolver })
    }
}

impl fmt::Debug for DnsMxResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsMxResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl MxResolver for DnsMxResolver {
    async fn lookup_mx(&self, domain: &str) -> SmtpResult<Vec<String>> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let records = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                let hosts = order_exchangers(records);
                if hosts.is_empty() {
                    return Err(SmtpError::dns(format!("No MX records found for {}", domain)));
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(domain, exchangers = ?hosts, "Resolved MX records");

                Ok(hosts)
            }
            // RFC 5321 section 5.1: without MX records the domain itself is
            // the implicit exchanger
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(domain, "No MX records, using the domain itself");

                Ok(vec![domain.trim_end_matches('.').to_string()])
            }
            Err(e) => Err(SmtpError::dns(format!("MX lookup for {} failed", domain)).with_cause(e)),
        }
    }
}

/// Sorts `(preference, host)` pairs and strips the root dot.
///
/// Null MX entries (RFC 7505, an exchanger of `.`) are dropped.
pub fn order_exchangers(mut records: Vec<(u16, String)>) -> Vec<String> {
    records.sort_by_key(|(preference, _)| *preference);
    records
        .into_iter()
        .map(|(_, host)| host.trim_end_matches('.').to_string())
        .filter(|host| !host.is_empty())
        .collect()
}
