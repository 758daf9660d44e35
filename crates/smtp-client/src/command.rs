use crate::client::SmtpClientTimeouts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A validated `local-part@domain` pair.
///
/// This is deliberately looser than a full RFC 5321 grammar: the engine
/// only ever emits addresses that were already validated upstream, so the
/// checks here guard against envelope injection rather than enforcing the
/// complete mailbox syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: String,
}

impl Mailbox {
    pub fn new<L: Into<String>, D: Into<String>>(local_part: L, domain: D) -> Self {
        Self {
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }
}

fn is_sane_address_text(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_ascii_control() || c == ' ' || c == '<' || c == '>')
}

impl TryFrom<&str> for Mailbox {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        let (local_part, domain) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("{s}: no @ sign in mailbox"))?;
        if !is_sane_address_text(local_part) || !is_sane_address_text(domain) {
            return Err(format!("{s}: invalid mailbox"));
        }
        Ok(Self::new(local_part, domain))
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

/// The sender portion of the envelope; the null sender is used for
/// bounce messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum ReversePath {
    NullSender,
    Mailbox(Mailbox),
}

impl TryFrom<&str> for ReversePath {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            Ok(Self::Mailbox(Mailbox::try_from(s)?))
        }
    }
}

impl std::fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NullSender => Ok(()),
            Self::Mailbox(mbox) => mbox.fmt(fmt),
        }
    }
}

/// The recipient portion of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum ForwardPath {
    Postmaster,
    Mailbox(Mailbox),
}

impl TryFrom<&str> for ForwardPath {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Ok(Self::Mailbox(Mailbox::try_from(s)?))
        }
    }
}

impl std::fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Postmaster => write!(fmt, "postmaster"),
            Self::Mailbox(mbox) => mbox.fmt(fmt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => write!(fmt, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    Noop(Option<String>),
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => {
                let mut params = String::new();
                for p in parameters {
                    params.push(' ');
                    params.push_str(&p.to_string());
                }

                format!("MAIL FROM:<{address}>{params}\r\n")
            }
            Self::RcptTo {
                address,
                parameters,
            } => {
                let mut params = String::new();
                for p in parameters {
                    params.push(' ');
                    params.push_str(&p.to_string());
                }

                format!("RCPT TO:<{address}>{params}\r\n")
            }
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
        }
    }

    /// Timeout for waiting for the reply to this command
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit | Self::Noop(_) => timeouts.idle_timeout,
            Self::Auth { .. } => timeouts.auth_timeout,
        }
    }

    /// Timeout for writing the request itself
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_envelope_commands() {
        let cmd = Command::MailFrom {
            address: ReversePath::try_from("who@example.com").unwrap(),
            parameters: vec![],
        };
        assert_eq!(cmd.encode(), "MAIL FROM:<who@example.com>\r\n");

        let cmd = Command::MailFrom {
            address: ReversePath::try_from("").unwrap(),
            parameters: vec![EsmtpParameter {
                name: "BODY".to_string(),
                value: Some("8BITMIME".to_string()),
            }],
        };
        assert_eq!(cmd.encode(), "MAIL FROM:<> BODY=8BITMIME\r\n");

        let cmd = Command::RcptTo {
            address: ForwardPath::try_from("other@example.com").unwrap(),
            parameters: vec![],
        };
        assert_eq!(cmd.encode(), "RCPT TO:<other@example.com>\r\n");
    }

    #[test]
    fn encode_auth() {
        let cmd = Command::Auth {
            sasl_mech: "PLAIN".to_string(),
            initial_response: Some("AGZvbwBiYXI=".to_string()),
        };
        assert_eq!(cmd.encode(), "AUTH PLAIN AGZvbwBiYXI=\r\n");
    }

    #[test]
    fn mailbox_validation() {
        assert!(Mailbox::try_from("no-at-sign").is_err());
        assert!(Mailbox::try_from("a b@example.com").is_err());
        assert!(Mailbox::try_from("a@exa<mple.com").is_err());
        assert_eq!(
            Mailbox::try_from("who@example.com").unwrap().to_string(),
            "who@example.com"
        );
    }
}
