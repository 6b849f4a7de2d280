//! Reader for the node's `resolv.conf`.
//!
//! The file is read once at startup and the resulting [`HostResolver`] is used
//! as the template for the DNS search domains handed to mutated pods.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use log::warn;

use crate::Error;

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolverOption {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostResolver {
    pub domains: Vec<String>,
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub sortlist: Vec<String>,
    pub options: Vec<ResolverOption>,
}

impl HostResolver {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(BufReader::new(file)))
    }

    /// Parses resolv.conf content. Unknown keywords and lines without a value are skipped.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than ending the read.
    pub fn parse(reader: impl BufRead) -> Self {
        let mut out = HostResolver::default();
        for line in reader.split(b'\n').map_while(Result::ok) {
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_start();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(kind), Some(first)) = (parts.next(), parts.next()) else {
                continue;
            };
            let rest = std::iter::once(first).chain(parts).map(str::to_string);
            match kind {
                "domain" => out.domains.extend(rest),
                "nameserver" => out.nameservers.push(first.to_string()),
                "search" => out.search.extend(rest),
                "sortlist" => out.sortlist.extend(rest),
                "options" => out.options.extend(rest.map(|option| {
                    let (name, value) = match option.split_once(':') {
                        Some((name, value)) => (name.to_string(), Some(value.to_string())),
                        None => (option.clone(), None),
                    };
                    ResolverOption { name, value }
                })),
                _ => (),
            }
        }
        out
    }

    /// Search domains scoped to `namespace`.
    ///
    /// Entries shaped like `<namespace>.svc.<cluster-domain>` get their first label
    /// replaced; empty and `.` entries are dropped. With no namespace the entries
    /// are kept as they are.
    pub fn searches_for_namespace(&self, namespace: Option<&str>) -> Vec<String> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let mut searches = self.search.clone();
        for search in searches.iter_mut() {
            let mut labels: Vec<&str> = search.split('.').collect();
            if labels.len() <= 2 || labels[1] != "svc" {
                continue;
            }
            match namespace {
                Some(ns) => {
                    labels[0] = ns;
                    *search = labels.join(".");
                }
                None => warn!("no namespace known for pod, keeping search domain {search}"),
            }
        }
        searches.retain(|search| !search.is_empty() && search != ".");
        searches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_RESOLV_CONF: &str = "\
# generated by kubelet
search gateway-system.svc.cluster.local svc.cluster.local cluster.local .
nameserver 10.96.0.10
nameserver   10.96.0.11 trailing
options ndots:5 edns0
sortlist 130.155.160.0/255.255.240.0 130.155.0.0
domain cluster.local
; legacy comment
bogus entry here
nameserver
";

    fn cluster() -> HostResolver {
        HostResolver::parse(CLUSTER_RESOLV_CONF.as_bytes())
    }

    #[test]
    fn parse_all_kinds() {
        let host = cluster();
        assert_eq!(
            host.search,
            vec![
                "gateway-system.svc.cluster.local",
                "svc.cluster.local",
                "cluster.local",
                "."
            ]
        );
        assert_eq!(host.nameservers, vec!["10.96.0.10", "10.96.0.11"]);
        assert_eq!(
            host.options,
            vec![
                ResolverOption {
                    name: "ndots".to_string(),
                    value: Some("5".to_string()),
                },
                ResolverOption {
                    name: "edns0".to_string(),
                    value: None,
                },
            ]
        );
        assert_eq!(host.sortlist, vec!["130.155.160.0/255.255.240.0", "130.155.0.0"]);
        assert_eq!(host.domains, vec!["cluster.local"]);
    }

    #[test]
    fn parse_empty() {
        assert_eq!(HostResolver::parse("".as_bytes()), HostResolver::default());
        assert_eq!(
            HostResolver::parse("#nameserver 1.1.1.1\n\n   \n".as_bytes()),
            HostResolver::default()
        );
    }

    #[test]
    fn parse_continues_past_invalid_utf8() {
        let parsed = HostResolver::parse(
            &b"nameserver 10.96.0.10\n# g\xe9n\xe9r\xe9\nnameserver 10.96.0.11\nsearch a.svc.cluster.local\n"[..],
        );
        assert_eq!(parsed.nameservers, vec!["10.96.0.10", "10.96.0.11"]);
        assert_eq!(parsed.search, vec!["a.svc.cluster.local"]);
    }

    #[test]
    fn load_missing_file() {
        let err = HostResolver::load("/nonexistent/resolv.conf").unwrap_err();
        assert!(matches!(err, Error::FileAccess { .. }));
    }

    #[test]
    fn searches_rewritten_for_namespace() {
        assert_eq!(
            cluster().searches_for_namespace(Some("media")),
            vec!["media.svc.cluster.local", "svc.cluster.local", "cluster.local"]
        );
    }

    #[test]
    fn searches_without_namespace() {
        let host = cluster();
        assert_eq!(
            host.searches_for_namespace(None),
            vec!["gateway-system.svc.cluster.local", "svc.cluster.local", "cluster.local"]
        );
        assert_eq!(host.searches_for_namespace(Some("")), host.searches_for_namespace(None));
    }

    #[test]
    fn searches_leave_snapshot_untouched() {
        let host = cluster();
        let _ = host.searches_for_namespace(Some("media"));
        assert_eq!(host, cluster());
    }

    #[test]
    fn searches_drop_empty_entries_in_order() {
        let host = HostResolver {
            search: vec![
                ".".to_string(),
                "a.svc.example".to_string(),
                "".to_string(),
                "corp.example".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(
            host.searches_for_namespace(Some("b")),
            vec!["b.svc.example", "corp.example"]
        );
    }
}
