use crate::routing::Destination;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Where the message payload lives. The data is not read until a
/// connection is actually about to transmit it.
#[derive(Debug, Clone)]
pub enum BodySource {
    File(Arc<PathBuf>),
    Memory(Arc<Vec<u8>>),
}

impl BodySource {
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(Arc::new(path.into()))
    }

    pub fn from_bytes<B: Into<Vec<u8>>>(data: B) -> Self {
        Self::Memory(Arc::new(data.into()))
    }
}

/// One recipient slot within a unit. The index refers back into the
/// scheduler's batch cache; the connection only ever holds this copy
/// of the addressing data, never the cache entry itself.
#[derive(Debug, Clone)]
pub struct UnitRecipient {
    pub index: usize,
    pub mailbox: String,
}

/// The unit of work handed to a connection: recipients sharing the
/// same sender, external message identifier and destination, sent
/// together in one MAIL transaction.
#[derive(Debug)]
pub struct MessageUnit {
    pub sender: String,
    pub message_id: String,
    pub destination: Destination,
    pub recipients: Vec<UnitRecipient>,
    body: BodySource,
    loaded: OnceCell<Arc<Vec<u8>>>,
}

impl MessageUnit {
    pub fn new(
        sender: String,
        message_id: String,
        destination: Destination,
        recipients: Vec<UnitRecipient>,
        body: BodySource,
    ) -> Self {
        Self {
            sender,
            message_id,
            destination,
            recipients,
            body,
            loaded: OnceCell::new(),
        }
    }

    /// Materialize the message payload, reading it at most once for
    /// the lifetime of the unit.
    pub async fn body(&self) -> std::io::Result<Arc<Vec<u8>>> {
        self.loaded
            .get_or_try_init(|| async {
                match &self.body {
                    BodySource::Memory(data) => Ok(data.clone()),
                    BodySource::File(path) => {
                        Ok(Arc::new(tokio::fs::read(path.as_ref()).await?))
                    }
                }
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_body_loads_without_io() {
        let unit = MessageUnit::new(
            "sender@example.com".to_string(),
            "msg-1".to_string(),
            Destination::Domain("example.com".to_string()),
            vec![],
            BodySource::from_bytes(b"hello".to_vec()),
        );
        assert_eq!(unit.body().await.unwrap().as_slice(), b"hello");
    }

    #[tokio::test]
    async fn missing_file_body_is_an_error() {
        let unit = MessageUnit::new(
            "sender@example.com".to_string(),
            "msg-1".to_string(),
            Destination::Domain("example.com".to_string()),
            vec![],
            BodySource::from_file("/nonexistent/spool/msg-1"),
        );
        assert!(unit.body().await.is_err());
    }
}
