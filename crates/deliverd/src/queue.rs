use crate::unit::BodySource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smtp_client::{EnhancedStatusCode, Response};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Queue-side lifecycle of one recipient. Exactly one of these holds at
/// any time; Busy is transient and must have resolved back to Ready or
/// on to Done by the time a batch is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Ready,
    Busy,
    Done,
}

/// Severity ordering used by the worst-wins rule. Success sorts lowest
/// so that a recorded failure is never downgraded by a stray later
/// success report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Classification {
    Success,
    Transient,
    Permanent,
}

/// The accumulated protocol outcome for one recipient: reply code,
/// optional RFC 3463 enhanced code, and the peer's diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl DeliveryStatus {
    pub fn with_code_and_message(code: u16, message: &str) -> Self {
        Response::with_code_and_message(code, message).into()
    }

    pub fn classification(&self) -> Classification {
        if self.code < 400 {
            Classification::Success
        } else if self.code < 500 {
            Classification::Transient
        } else {
            Classification::Permanent
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification() == Classification::Success
    }

    pub fn is_transient(&self) -> bool {
        self.classification() == Classification::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.classification() == Classification::Permanent
    }

    pub fn to_single_line(&self) -> String {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content.clone(),
            command: None,
        }
        .to_single_line()
    }
}

impl From<Response> for DeliveryStatus {
    fn from(response: Response) -> Self {
        Self {
            code: response.code,
            enhanced_code: response.enhanced_code,
            content: response.content,
        }
    }
}

impl From<&Response> for DeliveryStatus {
    fn from(response: &Response) -> Self {
        response.clone().into()
    }
}

/// One ready recipient handed to the engine by the queue.
///
/// The state and status fields are private so that every transition
/// goes through the worst-wins bookkeeping below.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub sender: String,
    pub recipient: String,
    pub domain: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub received_from: Option<IpAddr>,
    pub num_attempts: u32,
    pub body: BodySource,
    state: QueueState,
    status: Option<DeliveryStatus>,
}

impl QueueEntry {
    pub fn new<S, R, M>(id: u64, sender: S, recipient: R, message_id: M, body: BodySource) -> Self
    where
        S: Into<String>,
        R: AsRef<str>,
        M: Into<String>,
    {
        let recipient = recipient.as_ref();
        let domain = recipient
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            id,
            sender: sender.into(),
            recipient: recipient.to_string(),
            domain,
            message_id: message_id.into(),
            received_at: Utc::now(),
            received_from: None,
            num_attempts: 0,
            body,
            state: QueueState::Ready,
            status: None,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn status(&self) -> Option<&DeliveryStatus> {
        self.status.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == QueueState::Ready
    }

    pub(crate) fn mark_busy(&mut self) {
        debug_assert_eq!(self.state, QueueState::Ready);
        self.state = QueueState::Busy;
    }

    pub(crate) fn revert_ready(&mut self) {
        debug_assert_eq!(self.state, QueueState::Busy);
        self.state = QueueState::Ready;
    }

    /// Record a definitive outcome. Worst wins: an already recorded
    /// outcome is only replaced by a strictly worse classification,
    /// so a permanent failure observed early in a pipelined exchange
    /// cannot be downgraded by a stray later success.
    pub fn record(&mut self, status: DeliveryStatus) {
        let keep_prior = self
            .status
            .as_ref()
            .map(|prior| prior.classification() >= status.classification())
            .unwrap_or(false);
        if !keep_prior {
            self.status = Some(status);
        }
        self.state = QueueState::Done;
    }

    /// Record the outcome of an aborted or incomplete exchange.
    /// Unlike `record`, this never displaces a confirmed success.
    pub fn record_incomplete(&mut self, status: DeliveryStatus) {
        if self
            .status
            .as_ref()
            .map(|prior| prior.is_success())
            .unwrap_or(false)
        {
            self.state = QueueState::Done;
            return;
        }
        self.record(status);
    }
}

/// The durable queue, seen from the engine's side. Fetching marks
/// entries as in-flight on the queue's side; flushing hands back the
/// final states, from which the queue drives retry scheduling and
/// bounce generation.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn fetch_ready(&self, capacity: usize) -> anyhow::Result<Vec<QueueEntry>>;
    async fn flush(&self, batch: Vec<QueueEntry>) -> anyhow::Result<()>;
}

/// Retry backoff belongs to the queue, not to this engine; the curve
/// is supplied by the operator rather than baked in here.
#[derive(Clone)]
pub struct RetrySchedule(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl RetrySchedule {
    pub fn new<F: Fn(u32) -> Duration + Send + Sync + 'static>(policy: F) -> Self {
        Self(Arc::new(policy))
    }

    pub fn delay_for(&self, num_attempts: u32) -> Duration {
        (self.0)(num_attempts)
    }
}

impl std::fmt::Debug for RetrySchedule {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("RetrySchedule").finish()
    }
}
