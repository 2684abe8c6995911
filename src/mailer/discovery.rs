//! Mail server discovery through DNS MX records

use crate::error::{Error, MailError, Result};
use hickory_resolver::TokioAsyncResolver;

/// Domain part of an address (`Ops <ops@example.com>` → `example.com`)
pub fn recipient_domain(address: &str) -> Option<String> {
    let address = address.trim();
    let address = match (address.rfind('<'), address.rfind('>')) {
        (Some(start), Some(end)) if start < end => &address[start + 1..end],
        _ => address,
    };
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

/// MX hosts for `domain`, most preferred first
pub async fn lookup_mx(domain: &str) -> Result<Vec<String>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::Mail(MailError::NoServer(format!("{domain}: resolver unavailable: {e}"))))?;
    let lookup = resolver
        .mx_lookup(domain)
        .await
        .map_err(|e| Error::Mail(MailError::NoServer(format!("{domain}: {e}"))))?;

    let mut records: Vec<(u16, String)> = lookup
        .iter()
        .map(|mx| {
            let host = mx.exchange().to_utf8();
            (mx.preference(), host.trim_end_matches('.').to_string())
        })
        .filter(|(_, host)| !host.is_empty())
        .collect();
    records.sort();
    tracing::debug!(domain, servers = ?records, "MX lookup");

    if records.is_empty() {
        return Err(MailError::NoServer(domain.to_string()).into());
    }
    Ok(records.into_iter().map(|(_, host)| host).collect())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_extracted_from_plain_and_named_addresses() {
        assert_eq!(recipient_domain("ops@Example.COM").as_deref(), Some("example.com"));
        assert_eq!(
            recipient_domain("Ops Team <ops@mail.example.org>").as_deref(),
            Some("mail.example.org")
        );
        assert_eq!(recipient_domain("nobody"), None);
        assert_eq!(recipient_domain("trailing@"), None);
    }
}
