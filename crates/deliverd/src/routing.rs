use crate::policy::Tls;
use crate::queue::QueueEntry;
use cidr::AnyIpCidr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The identity a connection is opened against: either a statically
/// configured relay, or the recipient domain itself. Connection
/// counting, domain-wide error sweeps and refill matching all key on
/// this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Relay(String),
    Domain(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Relay(name) => write!(fmt, "relay:{name}"),
            Self::Domain(domain) => write!(fmt, "{domain}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    Plain,
    Login,
    External,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::External => "EXTERNAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    /// When set, this exact mechanism is required; otherwise the first
    /// mutually supported non-EXTERNAL mechanism is selected.
    #[serde(default)]
    pub mechanism: Option<SaslMechanism>,
}

/// A statically configured delivery target that overrides DNS-based
/// routing. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub name: String,
    pub address: String,
    #[serde(default = "Relay::default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Selection predicates. A relay matches an entry when any of
    /// its non-empty predicate lists matches.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub senders: Vec<String>,
    #[serde(default)]
    pub source_subnets: Vec<AnyIpCidr>,
}

impl Relay {
    fn default_port() -> u16 {
        25
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        if self
            .domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&entry.domain))
        {
            return true;
        }

        for pattern in &self.senders {
            // "@domain" matches any sender in that domain; anything
            // else is an exact address match
            let matched = match pattern.strip_prefix('@') {
                Some(domain) => entry
                    .sender
                    .rsplit_once('@')
                    .map(|(_, sender_domain)| sender_domain.eq_ignore_ascii_case(domain))
                    .unwrap_or(false),
                None => pattern.eq_ignore_ascii_case(&entry.sender),
            };
            if matched {
                return true;
            }
        }

        if let Some(source) = &entry.received_from {
            if self.source_subnets.iter().any(|net| net.contains(source)) {
                return true;
            }
        }

        false
    }
}

/// First-match relay lookup. Entries that match no relay are routed
/// by MX resolution of their recipient domain.
#[derive(Debug, Default)]
pub struct Router {
    relays: Vec<Arc<Relay>>,
}

impl Router {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self {
            relays: relays.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn route(&self, entry: &QueueEntry) -> Option<Arc<Relay>> {
        self.relays
            .iter()
            .find(|relay| relay.matches(entry))
            .cloned()
    }

    /// The destination identity used for grouping and connection
    /// accounting
    pub fn destination_for(&self, entry: &QueueEntry) -> (Destination, Option<Arc<Relay>>) {
        match self.route(entry) {
            Some(relay) => (Destination::Relay(relay.name.clone()), Some(relay)),
            None => (Destination::Domain(entry.domain.clone()), None),
        }
    }
}
