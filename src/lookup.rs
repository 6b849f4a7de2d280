use std::net::IpAddr;

use async_trait::async_trait;
use log::debug;

use crate::Error;

/// Forward name lookup.
///
/// Addresses are returned in the order the underlying resolver produced them.
/// That order is resolver and platform specific, and callers that take the first
/// address inherit it as-is.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, Error>;
}

/// Resolves through the platform resolver (`getaddrinfo`).
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| Error::Resolution {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Resolves `name` to its first address. IP literals are returned unchanged.
pub async fn resolve_host(resolver: &dyn NameResolver, name: &str) -> Result<String, Error> {
    let name = name.trim();
    if name.parse::<IpAddr>().is_ok() {
        return Ok(name.to_string());
    }
    let addrs = resolver.lookup(name).await?;
    debug!("resolved {name} to {addrs:?}");
    addrs
        .first()
        .map(ToString::to_string)
        .ok_or_else(|| Error::Resolution {
            name: name.to_string(),
            reason: "no addresses returned".to_string(),
        })
}

/// Resolves a comma separated list, keeping the first address of every entry in list order.
pub async fn resolve_list(resolver: &dyn NameResolver, names: &str) -> Result<Vec<String>, Error> {
    let mut out = vec![];
    for name in names.split(',').map(str::trim).filter(|x| !x.is_empty()) {
        out.push(resolve_host(resolver, name).await?);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// In-memory resolver; unknown names fail like an NXDOMAIN.
    #[derive(Default)]
    pub struct StaticResolver(pub HashMap<String, Vec<IpAddr>>);

    impl StaticResolver {
        pub fn with(mut self, name: &str, addrs: &[&str]) -> Self {
            self.0.insert(
                name.to_string(),
                addrs.iter().map(|x| x.parse().unwrap()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl NameResolver for StaticResolver {
        async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
            self.0.get(name).cloned().ok_or_else(|| Error::Resolution {
                name: name.to_string(),
                reason: "no such host".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn literal_ip_round_trips() {
        let resolver = StaticResolver::default();
        assert_eq!(resolve_host(&resolver, "1.2.3.4").await.unwrap(), "1.2.3.4");
        assert_eq!(resolve_host(&resolver, "fd00::1").await.unwrap(), "fd00::1");
        assert_eq!(
            resolve_host(&SystemResolver, "10.0.0.1").await.unwrap(),
            "10.0.0.1"
        );
    }

    #[tokio::test]
    async fn first_address_wins() {
        let resolver = StaticResolver::default().with("gateway.vpn", &["10.0.0.7", "10.0.0.3"]);
        assert_eq!(
            resolve_host(&resolver, "gateway.vpn").await.unwrap(),
            "10.0.0.7"
        );
    }

    #[tokio::test]
    async fn empty_answer_is_an_error() {
        let resolver = StaticResolver::default().with("empty.vpn", &[]);
        assert!(matches!(
            resolve_host(&resolver, "empty.vpn").await,
            Err(Error::Resolution { .. })
        ));
    }

    #[tokio::test]
    async fn list_keeps_order() {
        let resolver = StaticResolver::default().with("dns.vpn", &["10.0.0.53", "10.0.0.54"]);
        assert_eq!(
            resolve_list(&resolver, "5.6.7.8, dns.vpn,,9.10.11.12")
                .await
                .unwrap(),
            vec!["5.6.7.8", "10.0.0.53", "9.10.11.12"]
        );
        assert!(resolve_list(&resolver, "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_fails_on_any_entry() {
        let resolver = StaticResolver::default();
        let err = resolve_list(&resolver, "5.6.7.8,missing.vpn")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { name, .. } if name == "missing.vpn"));
    }

    #[tokio::test]
    async fn system_resolver_reports_failures() {
        assert!(matches!(
            resolve_host(&SystemResolver, "does-not-exist.invalid").await,
            Err(Error::Resolution { .. })
        ));
    }
}
