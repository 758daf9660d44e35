use cidr::AnyIpCidr;
use serde::{Deserialize, Serialize};
use smtp_client::SmtpClientTimeouts;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Copy)]
pub enum Tls {
    /// Use it if available. If the peer has invalid or self-signed certificates, then
    /// delivery will fail. Will NOT fallback to not using TLS if the peer advertises
    /// STARTTLS.
    Opportunistic,
    /// Use it if available, and allow self-signed or otherwise invalid server certs.
    /// Not recommended for sending to the public internet; this is for local/lab
    /// testing scenarios only.
    OpportunisticInsecure,
    /// TLS with valid certs is required.
    Required,
    /// Required, and allow self-signed or otherwise invalid server certs.
    /// Not recommended for sending to the public internet; this is for local/lab
    /// testing scenarios only.
    RequiredInsecure,
    /// Do not try to use TLS
    Disabled,
}

impl Tls {
    pub fn allow_insecure(&self) -> bool {
        matches!(self, Self::OpportunisticInsecure | Self::RequiredInsecure)
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required | Self::RequiredInsecure)
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self::Opportunistic
    }
}

/// Per-connection-class configuration, selected by matching the
/// destination's resolved address against the table below. Resolved
/// once per connection attempt and immutable for its lifetime.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionPolicy {
    #[serde(flatten)]
    pub client_timeouts: SmtpClientTimeouts,

    #[serde(default)]
    pub enable_tls: Tls,

    #[serde(default = "ConnectionPolicy::default_smtp_port")]
    pub smtp_port: u16,

    /// Minimum acceptable transfer rate in bytes/second while sending
    /// message payload; 0 disables the derived timeout extension
    #[serde(default = "ConnectionPolicy::default_min_data_rate")]
    pub min_data_rate: u64,

    #[serde(default = "ConnectionPolicy::default_max_pipelined_commands")]
    pub max_pipelined_commands: usize,

    #[serde(default = "ConnectionPolicy::default_max_recipients_per_message")]
    pub max_recipients_per_message: usize,

    #[serde(default)]
    pub max_messages_per_connection: Option<usize>,

    /// Fall back to HELO when the peer rejects EHLO with a permanent
    /// error
    #[serde(default = "ConnectionPolicy::default_true")]
    pub ehlo_helo_fallback: bool,

    /// Treat a domain without MX records as having an implicit MX of
    /// itself
    #[serde(default = "ConnectionPolicy::default_true")]
    pub mx_host_fallback: bool,

    #[serde(default = "ConnectionPolicy::default_true")]
    pub send_quit: bool,

    /// Wait for the peer's 221 after QUIT; disabling saves a round
    /// trip against peers known to hang up first
    #[serde(default = "ConnectionPolicy::default_true")]
    pub await_quit: bool,

    /// Hold the finished socket open for this long before dropping it
    #[serde(default, with = "humantime_serde")]
    pub close_linger: Option<Duration>,

    #[serde(default)]
    pub ehlo_domain: Option<String>,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            client_timeouts: SmtpClientTimeouts::default(),
            enable_tls: Tls::default(),
            smtp_port: Self::default_smtp_port(),
            min_data_rate: Self::default_min_data_rate(),
            max_pipelined_commands: Self::default_max_pipelined_commands(),
            max_recipients_per_message: Self::default_max_recipients_per_message(),
            max_messages_per_connection: None,
            ehlo_helo_fallback: Self::default_true(),
            mx_host_fallback: Self::default_true(),
            send_quit: Self::default_true(),
            await_quit: Self::default_true(),
            close_linger: None,
            ehlo_domain: None,
        }
    }
}

impl ConnectionPolicy {
    fn default_smtp_port() -> u16 {
        25
    }

    fn default_min_data_rate() -> u64 {
        1024
    }

    fn default_max_pipelined_commands() -> usize {
        50
    }

    fn default_max_recipients_per_message() -> usize {
        100
    }

    fn default_true() -> bool {
        true
    }

    /// The end-of-data timeout for a payload of `bytes`, never less
    /// than the configured data_dot_timeout: a peer accepting data
    /// below the minimum rate is treated the same as one that has
    /// stopped responding.
    pub fn data_dot_timeout_for(&self, bytes: usize) -> Duration {
        let configured = self.client_timeouts.data_dot_timeout;
        if self.min_data_rate == 0 {
            return configured;
        }
        let minimum_transfer_time = Duration::from_secs(bytes as u64 / self.min_data_rate + 1);
        configured.max(minimum_transfer_time)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PolicyClass {
    pub name: String,
    pub subnets: Vec<AnyIpCidr>,
    pub policy: ConnectionPolicy,
}

/// Connection policy table: the first class whose subnet list contains
/// the destination address wins, otherwise the default applies.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct PolicyTable {
    #[serde(default)]
    pub default: ConnectionPolicy,
    #[serde(default)]
    pub classes: Vec<PolicyClass>,
}

impl PolicyTable {
    pub fn for_address(&self, addr: IpAddr) -> &ConnectionPolicy {
        for class in &self.classes {
            if class.subnets.iter().any(|net| net.contains(&addr)) {
                return &class.policy;
            }
        }
        &self.default
    }
}
