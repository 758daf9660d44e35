use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::{Name, TokioAsyncResolver};

/// Classified resolution failure. The classification drives retry
/// decisions upstream: a name that does not exist will never start
/// existing within a retry horizon, while a lame or timing-out
/// server might recover.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("domain has no mail exchangers: {0}")]
    NoDomain(String),
    #[error("{0} is not a resolvable name")]
    BadName(String),
    #[error("DNS lookup for {0} timed out")]
    Timeout(String),
    #[error("DNS error for {name}: {error}")]
    Error { name: String, error: String },
}

impl ResolverError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoDomain(_) | Self::BadName(_))
    }

    fn from_resolve(name: &str, err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Self::NoDomain(name.to_string()),
            ResolveErrorKind::Timeout => Self::Timeout(name.to_string()),
            _ => Self::Error {
                name: name.to_string(),
                error: format!("{err:#}"),
            },
        }
    }
}

/// One usable destination address, tagged with the exchanger
/// hostname it was resolved from so that log lines and TLS
/// verification can name the host rather than the address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub name: String,
    pub addr: IpAddr,
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}/{}", self.name, self.addr)
    }
}

/// The resolution seam. The production implementation speaks DNS;
/// tests substitute a scripted table.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// The mail exchanger hostnames for `domain`, ordered by
    /// preference. An empty list means the domain exists but
    /// publishes no MX records.
    async fn resolve_mx_hosts(&self, domain: &str) -> Result<Vec<String>, ResolverError>;

    /// Address lookup for one exchanger hostname.
    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, ResolverError>;
}

/// The preference-ordered set of exchangers for one destination domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchanger {
    pub domain_name: String,
    pub hosts: Vec<String>,
}

impl MailExchanger {
    /// Resolve the exchanger list for `domain_name`.
    ///
    /// When the domain publishes no MX records and `fallback_to_host`
    /// is enabled, the domain name itself is used as the sole
    /// candidate, provided it resolves to at least one address.
    pub async fn resolve(
        domain_name: &str,
        resolver: &dyn MxResolver,
        fallback_to_host: bool,
    ) -> Result<Self, ResolverError> {
        let hosts = resolver.resolve_mx_hosts(domain_name).await?;

        let hosts = if hosts.is_empty() {
            if !fallback_to_host {
                return Err(ResolverError::NoDomain(domain_name.to_string()));
            }
            // Implicit MX: the domain itself, if it has an address
            resolver.resolve_host(domain_name).await?;
            vec![domain_name.to_string()]
        } else {
            hosts
        };

        Ok(Self {
            domain_name: domain_name.to_string(),
            hosts,
        })
    }

    /// RFC 7505: a single exchanger of "." advertises that the
    /// domain accepts no mail, ever.
    pub fn is_null_mx(&self) -> bool {
        self.hosts.len() == 1 && self.hosts[0] == "."
    }

    /// Expand the exchanger list into connectable addresses,
    /// preserving preference order. Hosts that fail to resolve are
    /// skipped rather than failing the whole set.
    pub async fn resolve_addresses(&self, resolver: &dyn MxResolver) -> Vec<ResolvedAddress> {
        let mut result = vec![];

        for mx_host in &self.hosts {
            // '.' is a null mx; skip trying to resolve it
            if mx_host == "." {
                continue;
            }
            match resolver.resolve_host(mx_host).await {
                Err(err) => {
                    tracing::debug!("failed to resolve {mx_host}: {err:#}");
                    continue;
                }
                Ok(addresses) => {
                    for addr in addresses {
                        result.push(ResolvedAddress {
                            name: mx_host.to_string(),
                            addr,
                        });
                    }
                }
            }
        }
        result
    }
}

/// DNS-backed resolver, configured from the system resolver
/// configuration.
pub struct DnsMxResolver {
    resolver: TokioAsyncResolver,
}

impl DnsMxResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

fn fully_qualify(name: &str) -> Result<Name, ResolverError> {
    let mut name = Name::from_str_relaxed(name)
        .map_err(|_| ResolverError::BadName(name.to_string()))?
        .to_lowercase();

    // Treat it as fully qualified
    name.set_fqdn(true);

    Ok(name)
}

#[async_trait]
impl MxResolver for DnsMxResolver {
    async fn resolve_mx_hosts(&self, domain: &str) -> Result<Vec<String>, ResolverError> {
        let name_fq = fully_qualify(domain)?;
        let mx_lookup = self
            .resolver
            .mx_lookup(name_fq)
            .await
            .map_err(|err| ResolverError::from_resolve(domain, err))?;

        struct ByPreference {
            hosts: Vec<String>,
            pref: u16,
        }

        let mut records: Vec<ByPreference> = vec![];
        for mx in mx_lookup.iter() {
            let pref = mx.preference();
            let host = mx.exchange().to_lowercase().to_string();

            if let Some(record) = records.iter_mut().find(|r| r.pref == pref) {
                record.hosts.push(host);
            } else {
                records.push(ByPreference {
                    hosts: vec![host],
                    pref,
                });
            }
        }

        // Sort by preference
        records.sort_unstable_by(|a, b| a.pref.cmp(&b.pref));

        // Sort the hosts at each preference level to produce the
        // overall ordered list of hosts for this destination
        let mut hosts = vec![];
        for mut mx in records {
            mx.hosts.sort();
            hosts.append(&mut mx.hosts);
        }

        Ok(hosts)
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, ResolverError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let name_fq = fully_qualify(host)?;
        let lookup = self
            .resolver
            .lookup_ip(name_fq)
            .await
            .map_err(|err| ResolverError::from_resolve(host, err))?;
        Ok(lookup.iter().collect())
    }
}
