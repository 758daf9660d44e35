use crate::policy::{ConnectionPolicy, PolicyTable, Tls};
use crate::queue::DeliveryStatus;
use crate::routing::{Credentials, Destination, Relay, SaslMechanism};
use crate::unit::{MessageUnit, UnitRecipient};
use anyhow::Context;
use dns_mx::{MailExchanger, MxResolver, ResolvedAddress, ResolverError};
use smtp_client::{ClientError, Command, ForwardPath, ReversePath, SmtpClient};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub(crate) type ConnId = u64;

/// State transitions a connection reports to its owning scheduler.
/// The scheduler is the only component that applies these to the
/// batch cache; a session never touches shared state directly.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A definitive outcome was decided for one recipient
    Recipient {
        conn: ConnId,
        index: usize,
        status: DeliveryStatus,
    },
    /// The current unit is settled; the session is willing to take
    /// another unit for the same destination over this connection
    RequestRefill {
        conn: ConnId,
        reply: oneshot::Sender<Option<MessageUnit>>,
    },
    /// The destination as a whole is unusable for the rest of this
    /// batch
    DestinationFailed { conn: ConnId, status: DeliveryStatus },
    /// The session is over. error is None for a clean close; anything
    /// else indicates a premature disconnect whose in-flight
    /// recipients have not all been decided.
    Closed { conn: ConnId, error: Option<String> },
}

/// A failure observed while working through the candidate address
/// list: either specific to one candidate (walk on to the next), or
/// final for the whole destination.
enum AttemptError {
    Candidate(String),
    Destination(DeliveryStatus),
}

pub(crate) struct Session {
    conn: ConnId,
    destination: Destination,
    relay: Option<Arc<Relay>>,
    unit: Option<MessageUnit>,
    resolver: Arc<dyn MxResolver>,
    policies: Arc<PolicyTable>,
    events: mpsc::UnboundedSender<SessionEvent>,
    messages_sent: usize,
}

impl Session {
    pub(crate) fn new(
        conn: ConnId,
        destination: Destination,
        relay: Option<Arc<Relay>>,
        unit: MessageUnit,
        resolver: Arc<dyn MxResolver>,
        policies: Arc<PolicyTable>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            conn,
            destination,
            relay,
            unit: Some(unit),
            resolver,
            policies,
            events,
            messages_sent: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let conn = self.conn;
        let events = self.events.clone();
        let error = match self.run_inner().await {
            Ok(()) => None,
            Err(err) => Some(format!("{err:#}")),
        };
        events.send(SessionEvent::Closed { conn, error }).ok();
    }

    fn report(&self, index: usize, status: DeliveryStatus) {
        self.events
            .send(SessionEvent::Recipient {
                conn: self.conn,
                index,
                status,
            })
            .ok();
    }

    fn destination_failed(&self, status: DeliveryStatus) {
        tracing::debug!("{}: destination failed: {}", self.destination, status.to_single_line());
        self.events
            .send(SessionEvent::DestinationFailed {
                conn: self.conn,
                status,
            })
            .ok();
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let (candidates, port) = match self.resolve_candidates().await {
            Ok(resolved) => resolved,
            Err(status) => {
                self.destination_failed(status);
                return Ok(());
            }
        };

        let mut connection_errors: Vec<String> = vec![];
        let mut established = None;

        for candidate in &candidates {
            match self.try_connect(candidate, port).await {
                Ok(client_and_policy) => {
                    established = Some(client_and_policy);
                    break;
                }
                Err(AttemptError::Candidate(error)) => {
                    // A bare connection failure never charges a
                    // recipient; walk on to the next exchanger
                    tracing::debug!("{}: {error}", self.destination);
                    connection_errors.push(error);
                }
                Err(AttemptError::Destination(status)) => {
                    self.destination_failed(status);
                    return Ok(());
                }
            }
        }

        let (mut client, policy) = match established {
            Some(pair) => pair,
            None => {
                self.destination_failed(DeliveryStatus::with_code_and_message(
                    421,
                    &format!(
                        "4.4.1 failed to connect to any candidate hosts: {}",
                        connection_errors.join(", ")
                    ),
                ));
                return Ok(());
            }
        };

        loop {
            self.send_unit(&mut client, &policy).await?;
            self.messages_sent += 1;

            if policy
                .max_messages_per_connection
                .map(|max| self.messages_sent >= max)
                .unwrap_or(false)
            {
                tracing::debug!(
                    "{}: sent {} messages and hit the per-connection cap",
                    self.destination,
                    self.messages_sent
                );
                break;
            }

            let (reply, next_unit) = oneshot::channel();
            self.events
                .send(SessionEvent::RequestRefill {
                    conn: self.conn,
                    reply,
                })
                .ok();
            match next_unit.await {
                Ok(Some(unit)) => {
                    let resp = client.send_command(&Command::Rset).await?;
                    if !resp.is_success() {
                        anyhow::bail!("RSET rejected: {}", resp.to_single_line());
                    }
                    self.unit = Some(unit);
                }
                _ => break,
            }
        }

        if policy.send_quit {
            if policy.await_quit {
                client.send_command(&Command::Quit).await.ok();
            } else {
                client.write_command(&Command::Quit).await.ok();
            }
        }
        if let Some(linger) = policy.close_linger {
            tokio::time::sleep(linger).await;
        }
        client.disconnect();

        Ok(())
    }

    /// Candidates come from the relay's fixed address when one is
    /// routed, else from MX resolution of the destination domain.
    async fn resolve_candidates(
        &self,
    ) -> Result<(Vec<ResolvedAddress>, u16), DeliveryStatus> {
        // Resolution happens before any address is known, so the
        // pre-connection knobs come from the default policy class
        let policy = &self.policies.default;

        match (&self.relay, &self.destination) {
            (Some(relay), _) => {
                let addresses = self
                    .resolver
                    .resolve_host(&relay.address)
                    .await
                    .map_err(resolver_status)?;
                Ok((
                    addresses
                        .into_iter()
                        .map(|addr| ResolvedAddress {
                            name: relay.address.clone(),
                            addr,
                        })
                        .collect(),
                    relay.port,
                ))
            }
            (None, Destination::Domain(domain)) => {
                let mx =
                    MailExchanger::resolve(domain, &*self.resolver, policy.mx_host_fallback)
                        .await
                        .map_err(resolver_status)?;

                if mx.is_null_mx() {
                    return Err(DeliveryStatus::with_code_and_message(
                        556,
                        "5.1.10 Recipient address has a null MX",
                    ));
                }

                let addresses = mx.resolve_addresses(&*self.resolver).await;
                if addresses.is_empty() {
                    return Err(DeliveryStatus::with_code_and_message(
                        451,
                        &format!("4.4.3 MX for {domain} did not resolve to any usable addresses"),
                    ));
                }
                Ok((addresses, policy.smtp_port))
            }
            (None, Destination::Relay(name)) => Err(DeliveryStatus::with_code_and_message(
                451,
                &format!("4.3.5 relay {name} is no longer configured"),
            )),
        }
    }

    /// Open a connection to one candidate and carry it through
    /// greeting, capability negotiation, TLS and authentication.
    async fn try_connect(
        &self,
        candidate: &ResolvedAddress,
        port: u16,
    ) -> Result<(SmtpClient, ConnectionPolicy), AttemptError> {
        let policy = self.policies.for_address(candidate.addr).clone();
        let timeouts = policy.client_timeouts;

        let stream = match timeout(
            timeouts.connect_timeout,
            TcpStream::connect((candidate.addr, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(AttemptError::Candidate(format!(
                    "connect to {candidate} port {port}: {err:#}"
                )))
            }
            Err(_) => {
                return Err(AttemptError::Candidate(format!(
                    "connect to {candidate} port {port}: timed out"
                )))
            }
        };
        stream.set_nodelay(true).ok();

        let mut client = SmtpClient::with_stream(stream, &candidate.name, timeouts);

        // Read banner
        let banner = match client.read_response(None, timeouts.connect_timeout).await {
            Ok(banner) => banner,
            Err(err) => {
                return Err(AttemptError::Candidate(format!(
                    "reading banner from {candidate}: {err:#}"
                )))
            }
        };
        if banner.code != 220 {
            return Err(AttemptError::Candidate(format!(
                "unexpected banner from {candidate}: {}",
                banner.to_single_line()
            )));
        }

        let ehlo_name = match &policy.ehlo_domain {
            Some(name) => name.to_string(),
            None => gethostname::gethostname()
                .to_str()
                .unwrap_or("[127.0.0.1]")
                .to_string(),
        };

        self.greet(&mut client, &policy, &ehlo_name, candidate)
            .await?;

        // Use STARTTLS if available
        let enable_tls = self
            .relay
            .as_ref()
            .and_then(|relay| relay.tls)
            .unwrap_or(policy.enable_tls);
        let has_tls = client.has_capability("STARTTLS");
        match (enable_tls, has_tls) {
            (Tls::Required | Tls::RequiredInsecure, false) => {
                client.send_command(&Command::Quit).await.ok();
                return Err(AttemptError::Destination(
                    DeliveryStatus::with_code_and_message(
                        451,
                        &format!(
                            "4.7.4 tls policy is {enable_tls:?} but {} does not advertise STARTTLS",
                            candidate.name
                        ),
                    ),
                ));
            }
            (Tls::Disabled, _)
            | (Tls::Opportunistic | Tls::OpportunisticInsecure, false) => {
                // Do not use TLS
            }
            (
                Tls::Opportunistic
                | Tls::OpportunisticInsecure
                | Tls::Required
                | Tls::RequiredInsecure,
                true,
            ) => {
                if let Err(err) = client.starttls(enable_tls.allow_insecure()).await {
                    return Err(AttemptError::Candidate(format!(
                        "STARTTLS to {candidate}: {err:#}"
                    )));
                }
                // The upgrade wipes the pre-TLS capabilities;
                // negotiate again on the encrypted channel
                self.greet(&mut client, &policy, &ehlo_name, candidate)
                    .await?;
            }
        }

        if let Some(credentials) = self.relay.as_ref().and_then(|relay| relay.credentials.as_ref())
        {
            self.authenticate(&mut client, credentials, candidate)
                .await?;
        }

        tracing::debug!("{}: connected to {candidate}", self.destination);
        Ok((client, policy))
    }

    async fn greet(
        &self,
        client: &mut SmtpClient,
        policy: &ConnectionPolicy,
        ehlo_name: &str,
        candidate: &ResolvedAddress,
    ) -> Result<(), AttemptError> {
        match client.ehlo(ehlo_name).await {
            Ok(_) => Ok(()),
            Err(ClientError::Rejected(resp))
                if resp.is_permanent() && policy.ehlo_helo_fallback =>
            {
                tracing::debug!(
                    "{candidate} rejected EHLO ({}), falling back to HELO",
                    resp.to_single_line()
                );
                match client.helo(ehlo_name).await {
                    Ok(_) => Ok(()),
                    Err(err) => Err(AttemptError::Candidate(format!(
                        "HELO to {candidate}: {err:#}"
                    ))),
                }
            }
            Err(err) => Err(AttemptError::Candidate(format!(
                "EHLO to {candidate}: {err:#}"
            ))),
        }
    }

    /// Select and drive a SASL exchange. Any definitive rejection is a
    /// destination-level failure so that the same credentials are not
    /// retried elsewhere in this batch.
    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        credentials: &Credentials,
        candidate: &ResolvedAddress,
    ) -> Result<(), AttemptError> {
        let advertised = client.sasl_mechanisms();

        let chosen = match credentials.mechanism {
            Some(mechanism) => {
                if advertised.iter().any(|m| m == mechanism.name()) {
                    mechanism
                } else {
                    client.send_command(&Command::Quit).await.ok();
                    return Err(AttemptError::Destination(
                        DeliveryStatus::with_code_and_message(
                            504,
                            &format!(
                                "5.5.4 required AUTH mechanism {} is not offered by {}",
                                mechanism.name(),
                                candidate.name
                            ),
                        ),
                    ));
                }
            }
            None => {
                // EXTERNAL asserts a transport identity, so it is only
                // used when explicitly required by the configuration
                match [SaslMechanism::Plain, SaslMechanism::Login]
                    .into_iter()
                    .find(|mech| advertised.iter().any(|m| m == mech.name()))
                {
                    Some(mechanism) => mechanism,
                    None => {
                        client.send_command(&Command::Quit).await.ok();
                        return Err(AttemptError::Destination(
                            DeliveryStatus::with_code_and_message(
                                504,
                                &format!(
                                    "5.5.4 no mutually supported AUTH mechanism with {} \
                                     (offered: {})",
                                    candidate.name,
                                    advertised.join(" ")
                                ),
                            ),
                        ));
                    }
                }
            }
        };

        let result = match chosen {
            SaslMechanism::Plain => {
                client
                    .auth_plain(&credentials.username, Some(&credentials.secret))
                    .await
            }
            SaslMechanism::Login => {
                client
                    .auth_login(&credentials.username, Some(&credentials.secret))
                    .await
            }
            SaslMechanism::External => client.auth_external(Some(&credentials.username)).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(ClientError::Rejected(resp)) => {
                client.send_command(&Command::Quit).await.ok();
                Err(AttemptError::Destination(resp.into()))
            }
            Err(err) => Err(AttemptError::Candidate(format!(
                "AUTH {} with {candidate}: {err:#}",
                chosen.name()
            ))),
        }
    }

    /// Run one MAIL transaction for the current unit. Every recipient
    /// of the unit receives a definitive report unless the transport
    /// itself fails, in which case the error bubbles up and the
    /// scheduler settles whatever was left undecided.
    async fn send_unit(
        &mut self,
        client: &mut SmtpClient,
        policy: &ConnectionPolicy,
    ) -> anyhow::Result<()> {
        let unit = self.unit.take().context("session has no unit to send")?;

        // A missing or unreadable body is a local, permanent problem;
        // it consumes no network attempt and leaves the connection
        // usable for the next unit
        let body = match unit.body().await {
            Ok(body) => body,
            Err(err) => {
                let status = DeliveryStatus::with_code_and_message(
                    550,
                    &format!("5.3.0 unable to read message body: {err}"),
                );
                for r in &unit.recipients {
                    self.report(r.index, status.clone());
                }
                return Ok(());
            }
        };

        let sender = match ReversePath::try_from(unit.sender.as_str()) {
            Ok(sender) => sender,
            Err(err) => {
                let status = DeliveryStatus::with_code_and_message(
                    550,
                    &format!("5.1.7 invalid sender address: {err}"),
                );
                for r in &unit.recipients {
                    self.report(r.index, status.clone());
                }
                return Ok(());
            }
        };

        let mut commands = vec![Command::MailFrom {
            address: sender,
            parameters: vec![],
        }];
        let mut rcpts: Vec<&UnitRecipient> = vec![];
        for r in &unit.recipients {
            match ForwardPath::try_from(r.mailbox.as_str()) {
                Ok(address) => {
                    commands.push(Command::RcptTo {
                        address,
                        parameters: vec![],
                    });
                    rcpts.push(r);
                }
                Err(err) => {
                    self.report(
                        r.index,
                        DeliveryStatus::with_code_and_message(
                            550,
                            &format!("5.1.3 invalid recipient address: {err}"),
                        ),
                    );
                }
            }
        }
        if rcpts.is_empty() {
            return Ok(());
        }

        let depth = if client.has_capability("PIPELINING") {
            policy.max_pipelined_commands
        } else {
            1
        };
        let mut responses = client.pipeline_commands(commands, depth).await.into_iter();

        let mail_resp = responses
            .next()
            .context("connection lost awaiting MAIL FROM response")??;
        if !mail_resp.is_success() {
            // The whole unit is unsendable with this envelope sender
            tracing::debug!(
                "{}: MAIL FROM rejected: {}",
                self.destination,
                mail_resp.to_single_line()
            );
            let status: DeliveryStatus = mail_resp.into();
            for r in rcpts {
                self.report(r.index, status.clone());
            }
            return Ok(());
        }

        let mut accepted: Vec<&UnitRecipient> = vec![];
        for r in rcpts {
            match responses.next() {
                Some(Ok(resp)) if resp.is_success() => accepted.push(r),
                Some(Ok(resp)) => self.report(r.index, resp.into()),
                Some(Err(err)) => return Err(err.into()),
                None => anyhow::bail!("connection lost awaiting RCPT TO response"),
            }
        }

        if accepted.is_empty() {
            tracing::debug!(
                "{}: no valid recipients for {}, not sending DATA",
                self.destination,
                unit.message_id
            );
            return Ok(());
        }

        let dot_timeout = policy.data_dot_timeout_for(body.len());
        match client.send_data(&body, dot_timeout).await {
            Ok(resp) => {
                // The end-of-data reply, success or failure, is the
                // definitive outcome for every accepted recipient
                let status: DeliveryStatus = resp.into();
                for r in accepted {
                    self.report(r.index, status.clone());
                }
                Ok(())
            }
            Err(ClientError::Rejected(resp)) => {
                // DATA itself was refused; no payload was transmitted
                let status: DeliveryStatus = resp.into();
                for r in accepted {
                    self.report(r.index, status.clone());
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn resolver_status(err: ResolverError) -> DeliveryStatus {
    if err.is_permanent() {
        DeliveryStatus::with_code_and_message(550, &format!("5.4.4 {err}"))
    } else {
        DeliveryStatus::with_code_and_message(451, &format!("4.4.3 {err}"))
    }
}
