//! End-to-end engine tests: a scripted SMTP listener on loopback, a
//! static resolver and an in-memory queue drive full batches through
//! the scheduler and session machinery.

use async_trait::async_trait;
use deliverd::{
    BodySource, ConnectionPolicy, Credentials, PolicyTable, Queue, QueueEntry, QueueState, Relay,
    Router, Scheduler, SchedulerConfig, StopHandle, Tls,
};
use dns_mx::{MxResolver, ResolverError};
use smtp_client::SmtpClientTimeouts;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<Vec<QueueEntry>>,
    settled: Mutex<Vec<QueueEntry>>,
}

impl MemoryQueue {
    fn with_entries(entries: Vec<QueueEntry>) -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(entries),
            settled: Mutex::new(vec![]),
        })
    }

    fn settled(&self) -> Vec<QueueEntry> {
        self.settled.lock().unwrap().clone()
    }

    fn ready_count(&self) -> usize {
        self.ready.lock().unwrap().len()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn fetch_ready(&self, capacity: usize) -> anyhow::Result<Vec<QueueEntry>> {
        let mut ready = self.ready.lock().unwrap();
        let take = capacity.min(ready.len());
        Ok(ready.drain(0..take).collect())
    }

    async fn flush(&self, batch: Vec<QueueEntry>) -> anyhow::Result<()> {
        for entry in batch {
            // The engine must never hand back a Busy entry
            assert_ne!(entry.state(), QueueState::Busy, "entry flushed while Busy");
            if entry.is_ready() {
                self.ready.lock().unwrap().push(entry);
            } else {
                self.settled.lock().unwrap().push(entry);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct StubResolver {
    mx: HashMap<String, Vec<String>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

#[async_trait]
impl MxResolver for StubResolver {
    async fn resolve_mx_hosts(&self, domain: &str) -> Result<Vec<String>, ResolverError> {
        self.mx
            .get(domain)
            .cloned()
            .ok_or_else(|| ResolverError::NoDomain(domain.to_string()))
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, ResolverError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| ResolverError::NoDomain(host.to_string()))
    }
}

#[derive(Default)]
struct ServerOptions {
    /// Mailboxes to reject at RCPT TO with a 550
    reject_rcpts: Vec<&'static str>,
    /// Advertise AUTH with this mechanism list
    advertise_auth: Option<&'static str>,
    /// Accept the message body but never send the end-of-data reply;
    /// the notify fires once the server is wedged there
    stall_at_data_dot: Option<Arc<Notify>>,
}

struct TestServer {
    port: u16,
    transcript: Arc<Mutex<Vec<String>>>,
    total_connections: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl TestServer {
    fn transcript(&self) -> Vec<String> {
        self.transcript.lock().unwrap().clone()
    }
}

async fn spawn_server(opts: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let transcript: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
    let total_connections = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let opts = Arc::new(opts);

    {
        let transcript = transcript.clone();
        let total_connections = total_connections.clone();
        let max_concurrent = max_concurrent.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                total_connections.fetch_add(1, Ordering::SeqCst);
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);

                let transcript = transcript.clone();
                let concurrent = concurrent.clone();
                let opts = opts.clone();
                tokio::spawn(async move {
                    serve_smtp(stream, opts, transcript).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
    }

    TestServer {
        port,
        transcript,
        total_connections,
        max_concurrent,
    }
}

async fn serve_smtp(
    stream: TcpStream,
    opts: Arc<ServerOptions>,
    transcript: Arc<Mutex<Vec<String>>>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    if write.write_all(b"220 mx.test service ready\r\n").await.is_err() {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        transcript.lock().unwrap().push(line.clone());
        let upper = line.to_ascii_uppercase();

        let reply: &[u8] = if upper.starts_with("EHLO") {
            match opts.advertise_auth {
                Some(mechs) => {
                    let caps = format!(
                        "250-mx.test\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n250 AUTH {mechs}\r\n"
                    );
                    write.write_all(caps.as_bytes()).await.ok();
                    continue;
                }
                None => b"250-mx.test\r\n250-PIPELINING\r\n250 ENHANCEDSTATUSCODES\r\n",
            }
        } else if upper.starts_with("AUTH") {
            b"235 2.7.0 authentication successful\r\n"
        } else if upper.starts_with("MAIL FROM") {
            b"250 2.1.0 sender ok\r\n"
        } else if upper.starts_with("RCPT TO") {
            let mailbox = line
                .split_once('<')
                .and_then(|(_, rest)| rest.split_once('>'))
                .map(|(addr, _)| addr)
                .unwrap_or("");
            if opts.reject_rcpts.contains(&mailbox) {
                b"550 5.1.1 no such user here\r\n"
            } else {
                b"250 2.1.5 recipient ok\r\n"
            }
        } else if upper == "DATA" {
            write.write_all(b"354 go ahead\r\n").await.ok();
            write.flush().await.ok();
            // consume the body up to the end-of-data marker
            while let Ok(Some(body_line)) = lines.next_line().await {
                if body_line == "." {
                    break;
                }
            }
            if let Some(stalled) = &opts.stall_at_data_dot {
                stalled.notify_one();
                // wedge: the reply never comes
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            }
            b"250 2.0.0 message accepted\r\n"
        } else if upper == "RSET" {
            b"250 2.0.0 reset\r\n"
        } else if upper == "QUIT" {
            write.write_all(b"221 2.0.0 bye\r\n").await.ok();
            return;
        } else {
            b"500 5.5.2 unrecognized\r\n"
        };

        if write.write_all(reply).await.is_err() {
            return;
        }
        write.flush().await.ok();
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    scheduler: Scheduler,
    stop: StopHandle,
}

fn entry(id: u64, recipient: &str, message_id: &str) -> QueueEntry {
    QueueEntry::new(
        id,
        "sender@origin.test",
        recipient,
        message_id,
        BodySource::from_bytes(b"Subject: test\r\n\r\nhello there\r\n".to_vec()),
    )
}

fn test_policy(port: u16) -> ConnectionPolicy {
    let mut policy = ConnectionPolicy::default();
    policy.client_timeouts = SmtpClientTimeouts::short_timeouts();
    policy.smtp_port = port;
    policy.ehlo_domain = Some("sender.test".to_string());
    policy
}

fn harness(
    entries: Vec<QueueEntry>,
    resolver: StubResolver,
    relays: Vec<Relay>,
    port: u16,
    config: SchedulerConfig,
) -> Harness {
    let queue = MemoryQueue::with_entries(entries);
    let policies = PolicyTable {
        default: test_policy(port),
        classes: vec![],
    };
    let (scheduler, stop) = Scheduler::new(
        queue.clone(),
        Arc::new(resolver),
        Arc::new(Router::new(relays)),
        Arc::new(policies),
        config,
    );
    Harness {
        queue,
        scheduler,
        stop,
    }
}

fn resolver_for(domain: &str, hosts: &[(&str, IpAddr)]) -> StubResolver {
    let mut resolver = StubResolver::default();
    resolver.mx.insert(
        domain.to_string(),
        hosts.iter().map(|(name, _)| name.to_string()).collect(),
    );
    for (name, addr) in hosts {
        resolver.hosts.insert(name.to_string(), vec![*addr]);
    }
    resolver
}

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Scenario A: one message, three recipients, same domain, all
/// accepted: one connection carries one MAIL FROM, three pipelined
/// RCPT TOs, DATA and QUIT, and all three recipients settle as
/// delivered.
#[tokio::test]
async fn batch_of_three_delivers_over_one_connection() {
    let server = spawn_server(ServerOptions::default()).await;
    let resolver = resolver_for("ok.test", &[("mx.ok.test", loopback())]);
    let mut h = harness(
        vec![
            entry(1, "one@ok.test", "m1"),
            entry(2, "two@ok.test", "m1"),
            entry(3, "three@ok.test", "m1"),
        ],
        resolver,
        vec![],
        server.port,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 3);
    for entry in &settled {
        assert_eq!(entry.state(), QueueState::Done);
        assert!(entry.status().unwrap().is_success(), "{entry:?}");
    }
    assert_eq!(server.total_connections.load(Ordering::SeqCst), 1);

    let commands = server.transcript();
    assert_eq!(commands[0], "EHLO sender.test");
    assert_eq!(commands[1], "MAIL FROM:<sender@origin.test>");
    assert_eq!(commands[2], "RCPT TO:<one@ok.test>");
    assert_eq!(commands[3], "RCPT TO:<two@ok.test>");
    assert_eq!(commands[4], "RCPT TO:<three@ok.test>");
    assert_eq!(commands[5], "DATA");
    assert_eq!(commands[6], "QUIT");
}

/// Scenario B: the second of three recipients is rejected with a 550;
/// the other two still get the message and only the rejected one is
/// recorded as a permanent failure.
#[tokio::test]
async fn single_rcpt_rejection_does_not_stop_the_message() {
    let server = spawn_server(ServerOptions {
        reject_rcpts: vec!["two@ok.test"],
        ..Default::default()
    })
    .await;
    let resolver = resolver_for("ok.test", &[("mx.ok.test", loopback())]);
    let mut h = harness(
        vec![
            entry(1, "one@ok.test", "m1"),
            entry(2, "two@ok.test", "m1"),
            entry(3, "three@ok.test", "m1"),
        ],
        resolver,
        vec![],
        server.port,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 3);
    for entry in &settled {
        let status = entry.status().unwrap();
        if entry.recipient == "two@ok.test" {
            assert!(status.is_permanent(), "{status:?}");
            assert_eq!(status.code, 550);
        } else {
            assert!(status.is_success(), "{status:?}");
        }
    }

    // DATA still proceeded for the surviving recipients
    assert!(server.transcript().iter().any(|line| line == "DATA"));
}

/// Scenario C: the first exchanger refuses the connection, the second
/// accepts; delivery succeeds with no domain-wide error and no
/// recipient penalty from the dead candidate.
#[tokio::test]
async fn connect_failure_walks_to_next_exchanger() {
    let server = spawn_server(ServerOptions::default()).await;
    // 127.0.0.2 has nothing listening: connection refused, fast
    let resolver = resolver_for(
        "ok.test",
        &[
            ("mxa.ok.test", "127.0.0.2".parse().unwrap()),
            ("mxb.ok.test", loopback()),
        ],
    );
    let mut h = harness(
        vec![entry(1, "one@ok.test", "m1")],
        resolver,
        vec![],
        server.port,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 1);
    assert!(settled[0].status().unwrap().is_success());
    assert_eq!(server.total_connections.load(Ordering::SeqCst), 1);
}

/// Scenario D: every exchanger refuses the connection. All pending
/// entries for the domain, including one in a unit that was never
/// dispatched, settle with the same transient domain error.
#[tokio::test]
async fn exhausted_candidates_fail_the_whole_domain() {
    let resolver = resolver_for(
        "dead.test",
        &[
            ("mxa.dead.test", "127.0.0.3".parse().unwrap()),
            ("mxb.dead.test", "127.0.0.4".parse().unwrap()),
        ],
    );
    let mut h = harness(
        vec![
            entry(1, "one@dead.test", "m1"),
            entry(2, "two@dead.test", "m1"),
            // a different message: stays behind the per-destination
            // ceiling and is settled purely by the sweep
            entry(3, "three@dead.test", "m2"),
        ],
        resolver,
        vec![],
        19, // never reached: connections are refused
        SchedulerConfig {
            destination_connection_limit: 1,
            ..Default::default()
        },
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 3);
    assert_eq!(h.queue.ready_count(), 0);
    for entry in &settled {
        let status = entry.status().unwrap();
        assert!(status.is_transient(), "{status:?}");
        assert_eq!(status.code, 421);
        assert!(status.content.contains("failed to connect"), "{status:?}");
    }
}

/// Scenario E: an administrative stop lands after RCPT TO was accepted
/// but before the end-of-data reply arrives. The recipient reverts to
/// Ready; it is neither success nor failure.
#[tokio::test]
async fn stop_mid_flight_reverts_to_ready() {
    let stalled = Arc::new(Notify::new());
    let server = spawn_server(ServerOptions {
        stall_at_data_dot: Some(stalled.clone()),
        ..Default::default()
    })
    .await;
    let resolver = resolver_for("ok.test", &[("mx.ok.test", loopback())]);
    let mut h = harness(
        vec![entry(1, "one@ok.test", "m1")],
        resolver,
        vec![],
        server.port,
        SchedulerConfig::default(),
    );

    let stop = h.stop.clone();
    let stopper = tokio::spawn(async move {
        stalled.notified().await;
        // a connection is open, so the stop cannot complete
        // synchronously
        assert!(!stop.stop());
    });

    assert!(h.scheduler.run_batch().await.unwrap());
    stopper.await.unwrap();

    assert_eq!(h.queue.settled().len(), 0);
    assert_eq!(h.queue.ready_count(), 1);
    let ready = h.queue.ready.lock().unwrap();
    assert_eq!(ready[0].state(), QueueState::Ready);
    assert!(ready[0].status().is_none());
}

/// The watchdog bounds batch wall-clock even when the peer wedges and
/// no stop is ever requested.
#[tokio::test]
async fn watchdog_kills_slow_senders() {
    let stalled = Arc::new(Notify::new());
    let server = spawn_server(ServerOptions {
        stall_at_data_dot: Some(stalled.clone()),
        ..Default::default()
    })
    .await;
    let resolver = resolver_for("ok.test", &[("mx.ok.test", loopback())]);
    let mut h = harness(
        vec![entry(1, "one@ok.test", "m1")],
        resolver,
        vec![],
        server.port,
        SchedulerConfig {
            batch_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    assert_eq!(h.queue.settled().len(), 0);
    assert_eq!(h.queue.ready_count(), 1);
}

/// Refill-on-completion: two messages for the same destination ride
/// one connection, separated by RSET, amortizing the connection setup.
#[tokio::test]
async fn connection_is_reused_for_the_same_destination() {
    let server = spawn_server(ServerOptions::default()).await;
    let resolver = resolver_for("ok.test", &[("mx.ok.test", loopback())]);
    let mut h = harness(
        vec![
            entry(1, "one@ok.test", "m1"),
            entry(2, "two@ok.test", "m2"),
        ],
        resolver,
        vec![],
        server.port,
        SchedulerConfig {
            destination_connection_limit: 1,
            ..Default::default()
        },
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(|e| e.status().unwrap().is_success()));

    assert_eq!(server.total_connections.load(Ordering::SeqCst), 1);
    let commands = server.transcript();
    assert_eq!(
        commands.iter().filter(|line| *line == "RSET").count(),
        1,
        "{commands:?}"
    );
    assert_eq!(
        commands
            .iter()
            .filter(|line| line.starts_with("MAIL FROM"))
            .count(),
        2
    );
}

/// The global connection ceiling holds; entries beyond it stay Ready
/// and are picked up by the next batch.
#[tokio::test]
async fn global_connection_ceiling_is_respected() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut resolver = StubResolver::default();
    for domain in ["d1.test", "d2.test", "d3.test", "d4.test"] {
        resolver
            .mx
            .insert(domain.to_string(), vec!["mx.test".to_string()]);
    }
    resolver.hosts.insert("mx.test".to_string(), vec![loopback()]);

    let mut h = harness(
        vec![
            entry(1, "a@d1.test", "m1"),
            entry(2, "b@d2.test", "m2"),
            entry(3, "c@d3.test", "m3"),
            entry(4, "d@d4.test", "m4"),
        ],
        resolver,
        vec![],
        server.port,
        SchedulerConfig {
            global_connection_limit: 2,
            ..Default::default()
        },
    );

    assert!(h.scheduler.run_batch().await.unwrap());
    assert_eq!(h.queue.settled().len(), 2);
    assert_eq!(h.queue.ready_count(), 2);
    assert!(server.max_concurrent.load(Ordering::SeqCst) <= 2);

    // the next batch picks up what was left Ready
    assert!(h.scheduler.run_batch().await.unwrap());
    assert_eq!(h.queue.settled().len(), 4);
    assert!(server.max_concurrent.load(Ordering::SeqCst) <= 2);
    assert!(h
        .queue
        .settled()
        .iter()
        .all(|e| e.status().unwrap().is_success()));
}

/// Relay routing with SASL: the matching relay overrides MX lookup
/// and the session authenticates before sending.
#[tokio::test]
async fn relay_overrides_mx_and_authenticates() {
    let server = spawn_server(ServerOptions {
        advertise_auth: Some("PLAIN LOGIN"),
        ..Default::default()
    })
    .await;
    let mut resolver = StubResolver::default();
    resolver
        .hosts
        .insert("smart.test".to_string(), vec![loopback()]);

    let relay = Relay {
        name: "smart".to_string(),
        address: "smart.test".to_string(),
        port: server.port,
        tls: None,
        credentials: Some(Credentials {
            username: "mailer".to_string(),
            secret: "sekrit".to_string(),
            mechanism: None,
        }),
        domains: vec!["relay.test".to_string()],
        senders: vec![],
        source_subnets: vec![],
    };

    let mut h = harness(
        vec![entry(1, "one@relay.test", "m1")],
        resolver,
        vec![relay],
        server.port,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 1);
    assert!(settled[0].status().unwrap().is_success());
    assert!(server
        .transcript()
        .iter()
        .any(|line| line.starts_with("AUTH PLAIN ")));
}

/// A relay that requires TLS against a peer that does not advertise
/// STARTTLS aborts the destination without sending mail.
#[tokio::test]
async fn required_tls_not_advertised_fails_destination() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut resolver = StubResolver::default();
    resolver
        .hosts
        .insert("smart.test".to_string(), vec![loopback()]);

    let relay = Relay {
        name: "secure".to_string(),
        address: "smart.test".to_string(),
        port: server.port,
        tls: Some(Tls::Required),
        credentials: None,
        domains: vec!["secure.test".to_string()],
        senders: vec![],
        source_subnets: vec![],
    };

    let mut h = harness(
        vec![entry(1, "one@secure.test", "m1")],
        resolver,
        vec![relay],
        server.port,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 1);
    let status = settled[0].status().unwrap();
    assert!(status.is_transient(), "{status:?}");
    assert!(status.content.contains("STARTTLS"), "{status:?}");
    assert!(!server.transcript().iter().any(|line| line == "DATA"));
}

/// An unknown domain is a permanent, resolver-classified failure.
#[tokio::test]
async fn unknown_domain_is_permanent() {
    let resolver = StubResolver::default();
    let mut h = harness(
        vec![entry(1, "one@nowhere.test", "m1")],
        resolver,
        vec![],
        19,
        SchedulerConfig::default(),
    );

    assert!(h.scheduler.run_batch().await.unwrap());

    let settled = h.queue.settled();
    assert_eq!(settled.len(), 1);
    assert!(settled[0].status().unwrap().is_permanent());
}
