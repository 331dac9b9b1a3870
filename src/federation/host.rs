//! Outbound host policy
//!
//! Every remote dereference and delivery passes through [`HostPolicy`] so
//! that documents cannot steer the server at loopback or private networks.

use std::net::IpAddr;

use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation("No DNS records for host".to_string()));
    }

    Ok(())
}

/// Which remote URLs the server may contact.
#[derive(Debug, Clone, Copy)]
pub struct HostPolicy {
    allow_private: bool,
}

impl HostPolicy {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Validate a URL before contacting it.
    ///
    /// Only http(s) is accepted. Unless private addresses are allowed, the
    /// host must neither be nor resolve to a loopback/private address.
    pub async fn check(&self, url: &str) -> Result<url::Url, AppError> {
        let parsed =
            url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
            .to_ascii_lowercase();

        if self.allow_private {
            return Ok(parsed);
        }

        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden);
        }

        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_literals_are_disallowed() {
        assert!(is_disallowed_host("localhost"));
        assert!(is_disallowed_host("127.0.0.1"));
        assert!(is_disallowed_host("10.1.2.3"));
        assert!(is_disallowed_host("[::1]"));
        assert!(!is_disallowed_host("remote.example"));
    }

    #[tokio::test]
    async fn strict_policy_rejects_loopback() {
        let policy = HostPolicy::new(false);
        assert!(matches!(
            policy.check("http://127.0.0.1:8080/users/a").await,
            Err(AppError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn permissive_policy_allows_loopback() {
        let policy = HostPolicy::new(true);
        assert!(policy.check("http://127.0.0.1:8080/users/a").await.is_ok());
    }

    #[tokio::test]
    async fn non_http_schemes_are_rejected() {
        let policy = HostPolicy::new(true);
        assert!(matches!(
            policy.check("tag:example.com,2018:note").await,
            Err(AppError::Validation(_))
        ));
    }
}
