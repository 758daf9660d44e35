use crate::response::{parse_response_line, ResponseBuilder};
use crate::tls::build_tls_connector;
use crate::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, Response};
use data_encoding::BASE64;
use memchr::memmem::Finder;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
}

impl ClientError {
    /// The response the peer rejected us with, if this error is
    /// a rejection rather than a connection-level failure
    pub fn rejection(&self) -> Option<&Response> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_ehlo_timeout",
        with = "humantime_serde"
    )]
    pub ehlo_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_mail_from_timeout",
        with = "humantime_serde"
    )]
    pub mail_from_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rcpt_to_timeout",
        with = "humantime_serde"
    )]
    pub rcpt_to_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_data_timeout",
        with = "humantime_serde"
    )]
    pub data_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_data_dot_timeout",
        with = "humantime_serde"
    )]
    pub data_dot_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rset_timeout",
        with = "humantime_serde"
    )]
    pub rset_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_idle_timeout",
        with = "humantime_serde"
    )]
    pub idle_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_starttls_timeout",
        with = "humantime_serde"
    )]
    pub starttls_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_auth_timeout",
        with = "humantime_serde"
    )]
    pub auth_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            ehlo_timeout: Self::default_ehlo_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            data_timeout: Self::default_data_timeout(),
            data_dot_timeout: Self::default_data_dot_timeout(),
            rset_timeout: Self::default_rset_timeout(),
            idle_timeout: Self::default_idle_timeout(),
            starttls_timeout: Self::default_starttls_timeout(),
            auth_timeout: Self::default_auth_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_auth_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_ehlo_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_dot_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rset_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_starttls_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(20);
        Self {
            connect_timeout: short,
            ehlo_timeout: short,
            mail_from_timeout: short,
            rcpt_to_timeout: short,
            data_timeout: short,
            data_dot_timeout: short,
            rset_timeout: short,
            idle_timeout: short,
            starttls_timeout: short,
            auth_timeout: short,
        }
    }

    /// Compute theoretical maximum lifetime of a single message send
    pub fn total_message_send_duration(&self) -> Duration {
        self.connect_timeout
            + self.ehlo_timeout
            + self.auth_timeout
            + self.mail_from_timeout
            + self.rcpt_to_timeout
            + self.data_timeout
            + self.data_dot_timeout
            + self.starttls_timeout
            + self.idle_timeout
    }
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

impl SmtpClient {
    pub async fn new<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: SmtpClientTimeouts,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr.clone()).await?;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// The SASL mechanisms advertised via the AUTH capability
    pub fn sasl_mechanisms(&self) -> Vec<String> {
        match self.capabilities.get("AUTH") {
            Some(EsmtpCapability {
                param: Some(param), ..
            }) => param
                .split_ascii_whitespace()
                .map(|mech| mech.to_ascii_uppercase())
                .collect(),
            _ => vec![],
        }
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let code = parsed.code;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));

        tracing::trace!(
            "{}: {command:?} response: {code} {:?} {}",
            self.hostname,
            response.enhanced_code,
            response.content
        );

        Ok(response)
    }

    /// Write a command without waiting for its reply. Used for
    /// fire-and-forget goodbyes where the peer's 221 is not worth a
    /// round trip.
    pub async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        self.write_command_request(command).await?;
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }
        Ok(())
    }

    async fn write_command_request(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);
        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(
                    command.client_timeout_request(&self.timeouts),
                    socket.write_all(line.as_bytes()),
                )
                .await
                {
                    Ok(result) => result.map_err(|_| ClientError::NotConnected),
                    Err(_) => Err(ClientError::TimeOutRequest {
                        command: command.clone(),
                        duration: command.client_timeout_request(&self.timeouts),
                    }),
                }
            }
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command_request(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Issue a series of commands, and return the responses to
    /// those commands.
    ///
    /// At most `max_outstanding` commands are written before their
    /// replies are consumed; replies are always matched to requests
    /// in FIFO order. Callers pass `max_outstanding <= 1` when the
    /// peer did not advertise RFC 2920 PIPELINING, which degrades
    /// to a strict write/read/write/read exchange.
    ///
    /// The number of returned responses may be smaller than the
    /// number of requested commands if there is an issue with
    /// the network connection.
    pub async fn pipeline_commands(
        &mut self,
        commands: Vec<Command>,
        max_outstanding: usize,
    ) -> Vec<Result<Response, ClientError>> {
        let max_outstanding = max_outstanding.max(1);
        let mut results: Vec<Result<Response, ClientError>> = vec![];
        let mut pending: Vec<&Command> = vec![];

        for cmd in &commands {
            if let Err(err) = self.write_command_request(cmd).await {
                results.push(Err(err));
                return results;
            }
            pending.push(cmd);

            if pending.len() >= max_outstanding {
                for cmd in pending.drain(..) {
                    let res = self
                        .read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await;
                    let failed = res.is_err();
                    results.push(res);
                    if failed {
                        return results;
                    }
                }
            }
        }

        for cmd in pending.drain(..) {
            let res = self
                .read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                .await;
            let failed = res.is_err();
            results.push(res);
            if failed {
                return results;
            }
        }

        results
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Old-school greeting for peers that reject EHLO.
    /// No capabilities are advertised in this mode.
    pub async fn helo(&mut self, helo_name: &str) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::Helo(helo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        self.capabilities.clear();
        Ok(response)
    }

    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        // RFC 4616 says that the format is:
        // [authzid] NUL authcid NUL passwd
        let password = password.unwrap_or("");
        let payload = format!("\x00{username}\x00{password}");
        let payload = BASE64.encode(payload.as_bytes());

        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "PLAIN".to_string(),
                initial_response: Some(payload),
            })
            .await?;

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// RFC 4954 style LOGIN: the username and password are each
    /// solicited by a 334 continuation from the server
    pub async fn auth_login(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "LOGIN".to_string(),
                initial_response: None,
            })
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_challenge_response(&BASE64.encode(username.as_bytes()))
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_challenge_response(&BASE64.encode(password.unwrap_or("").as_bytes()))
            .await?;
        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// EXTERNAL asserts an identity already established by the
    /// transport layer, typically a TLS client certificate
    pub async fn auth_external(&mut self, authzid: Option<&str>) -> Result<(), ClientError> {
        let initial = match authzid {
            Some(id) => BASE64.encode(id.as_bytes()),
            None => "=".to_string(),
        };
        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "EXTERNAL".to_string(),
                initial_response: Some(initial),
            })
            .await?;
        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    async fn send_challenge_response(&mut self, payload: &str) -> Result<Response, ClientError> {
        match self.socket.as_mut() {
            Some(socket) => {
                let line = format!("{payload}\r\n");
                match timeout(self.timeouts.auth_timeout, socket.write_all(line.as_bytes())).await {
                    Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                    Err(_) => return Err(ClientError::TimeOutData),
                }
            }
            None => return Err(ClientError::NotConnected),
        }
        self.read_response(None, self.timeouts.auth_timeout).await
    }

    /// Attempt the STARTTLS handshake, consuming the plaintext socket
    /// and replacing it with the encrypted channel on success.
    /// The previously learned capabilities are discarded; the caller
    /// must re-issue EHLO on the upgraded channel.
    pub async fn starttls(&mut self, insecure: bool) -> Result<(), ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }

        let connector = build_tls_connector(insecure);
        let server_name = match IpAddr::from_str(self.hostname.as_str()) {
            Ok(ip) => ServerName::IpAddress(ip),
            Err(_) => ServerName::try_from(self.hostname.as_str())
                .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?,
        };

        let socket = self.socket.take().ok_or(ClientError::NotConnected)?;
        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, socket),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.socket.replace(Box::new(stream));
                self.capabilities.clear();
                Ok(())
            }
            Ok(Err(err)) => Err(ClientError::HandshakeFailed(format!("{err:#}"))),
            Err(_) => Err(ClientError::HandshakeFailed(format!(
                "timed out after {:?}",
                self.timeouts.starttls_timeout
            ))),
        }
    }

    /// Issue DATA, stream the (dot-stuffed) message payload and the
    /// terminating marker, then return the end-of-data reply.
    ///
    /// `data_dot_timeout` overrides the configured end-of-data timeout;
    /// callers derive it from the minimum acceptable transfer rate for
    /// the size of this particular payload.
    pub async fn send_data(
        &mut self,
        data: &[u8],
        data_dot_timeout: Duration,
    ) -> Result<Response, ClientError> {
        let data_resp = self.send_command(&Command::Data).await?;
        if data_resp.code != 354 {
            return Err(ClientError::Rejected(data_resp));
        }

        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        match self.socket.as_mut() {
            Some(sock) => match timeout(data_dot_timeout, sock.write_all(data)).await {
                Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                Err(_) => return Err(ClientError::TimeOutData),
            },
            None => return Err(ClientError::NotConnected),
        }

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };

        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        match self.socket.as_mut() {
            Some(sock) => match timeout(data_dot_timeout, sock.write_all(marker.as_bytes())).await
            {
                Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                Err(_) => return Err(ClientError::TimeOutData),
            },
            None => return Err(ClientError::NotConnected),
        }

        self.read_response(Some(&Command::DataDot), data_dot_timeout)
            .await
    }

    /// Drop the socket without any protocol goodbye
    pub fn disconnect(&mut self) {
        self.socket.take();
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: Lazy<Finder> = Lazy::new(|| memchr::memmem::Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
