use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::protocol::opcodes::PropertyAckStatus;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reply {
    Info(Vec<String>),
    PropertyAck(PropertyAckStatus),
}

/// Requests to the hub that are waiting for their reply, keyed by request id.
#[derive(Default)]
pub struct PendingReplies {
    next_id: AtomicU32,
    pending: Mutex<FxHashMap<u32, oneshot::Sender<Reply>>>,
}

impl PendingReplies {
    pub async fn register(&self) -> (u32, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        (id, rx)
    }

    pub async fn complete(&self, request_id: u32, reply: Reply) -> bool {
        match self.pending.lock().await.remove(&request_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!("reply for request {} that is no longer pending", request_id);
                false
            }
        }
    }

    pub async fn cancel(&self, request_id: u32) {
        self.pending.lock().await.remove(&request_id);
    }

    /// drops all pending requests; their receivers see a closed channel
    pub async fn fail_all(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_complete() {
        let replies = PendingReplies::default();
        let (id1, rx1) = replies.register().await;
        let (id2, _rx2) = replies.register().await;
        assert_ne!(id1, id2);
        assert_eq!(replies.len().await, 2);

        assert!(replies.complete(id1, Reply::Info(vec!["a".to_string()])).await);
        assert_eq!(rx1.await.unwrap(), Reply::Info(vec!["a".to_string()]));
        assert!(!replies.complete(id1, Reply::Info(vec![])).await);
        assert_eq!(replies.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_and_fail_all() {
        let replies = PendingReplies::default();
        let (id1, _rx1) = replies.register().await;
        let (_, rx2) = replies.register().await;

        replies.cancel(id1).await;
        assert!(!replies.complete(id1, Reply::PropertyAck(PropertyAckStatus::Accepted)).await);

        replies.fail_all().await;
        assert!(rx2.await.is_err());
        assert_eq!(replies.len().await, 0);
    }
}
