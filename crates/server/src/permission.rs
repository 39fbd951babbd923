//! Permission Broker: matches a tool-use permission request, a
//! `askUserQuestion`, or an `exitPlanMode` request against the client's
//! eventual reply.
//!
//! A `Mutex`-guarded map of outstanding `oneshot::Sender`s raced
//! against `tokio::time::timeout`. A reply for a request that already
//! timed out, or a second reply for the same id, finds no waiting
//! sender and is a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gateway_protocol::PermissionDecision;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
pub enum PermissionReply {
    Permission {
        decision: PermissionDecision,
        updated_input: Option<Value>,
    },
    Question {
        answers: Vec<String>,
    },
    ExitPlanMode {
        approved: bool,
    },
}

type RequestId = Uuid;

#[derive(Default)]
pub struct PermissionBroker {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<PermissionReply>>>,
}

impl PermissionBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new outstanding request and wait up to `timeout` for
    /// its reply. On timeout (or the sender being dropped because the
    /// owning Session was destroyed) the pending slot is removed.
    pub async fn wait_for_reply(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> GatewayResult<PermissionReply> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id, tx);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Always clear the slot: a post-timeout reply must find nothing.
        self.pending.lock().await.remove(&request_id);

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::Fatal(
                "permission broker sender dropped before reply".to_string(),
            )),
            Err(_) => Err(GatewayError::PermissionTimeout),
        }
    }

    /// Deliver a reply for `request_id`. Returns `true` if a waiter was
    /// actually resolved, `false` if the request had already timed out
    /// or been answered (first wins; second is a no-op).
    pub async fn reply(&self, request_id: RequestId, reply: PermissionReply) -> bool {
        let sender = self.pending.lock().await.remove(&request_id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Resolve every outstanding request for a destroyed/reset session
    /// as a deny, so nothing is left hanging past the owning session's
    /// lifetime. Callers identify which ids belong to the session.
    pub async fn cancel_all(&self, request_ids: &[RequestId]) {
        let mut pending = self.pending.lock().await;
        for id in request_ids {
            pending.remove(id);
        }
    }

    pub async fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.lock().await.contains_key(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_before_timeout_resolves_waiter() {
        let broker = PermissionBroker::new();
        let id = Uuid::new_v4();
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2.wait_for_reply(id, Duration::from_secs(5)).await
        });

        tokio::task::yield_now().await;
        let delivered = broker
            .reply(
                id,
                PermissionReply::Permission {
                    decision: PermissionDecision::Allow,
                    updated_input: None,
                },
            )
            .await;
        assert!(delivered);

        let reply = waiter.await.unwrap().unwrap();
        assert!(matches!(
            reply,
            PermissionReply::Permission {
                decision: PermissionDecision::Allow,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_without_reply_returns_permission_timeout() {
        let broker = PermissionBroker::new();
        let id = Uuid::new_v4();
        let result = broker.wait_for_reply(id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(GatewayError::PermissionTimeout)));
    }

    #[tokio::test]
    async fn reply_after_timeout_is_a_no_op() {
        let broker = PermissionBroker::new();
        let id = Uuid::new_v4();
        let _ = broker.wait_for_reply(id, Duration::from_millis(10)).await;

        let delivered = broker
            .reply(id, PermissionReply::ExitPlanMode { approved: true })
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn second_reply_for_same_request_is_a_no_op() {
        let broker = PermissionBroker::new();
        let id = Uuid::new_v4();
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2.wait_for_reply(id, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;

        let first = broker
            .reply(id, PermissionReply::Question { answers: vec!["a".to_string()] })
            .await;
        let second = broker
            .reply(id, PermissionReply::Question { answers: vec!["b".to_string()] })
            .await;

        assert!(first);
        assert!(!second);
        let _ = waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_all_removes_pending_slot() {
        let broker = PermissionBroker::new();
        let id = Uuid::new_v4();
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2.wait_for_reply(id, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;

        assert!(broker.is_pending(id).await);
        broker.cancel_all(&[id]).await;
        assert!(!broker.is_pending(id).await);

        // The waiter now sees the sender dropped.
        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }
}
