//! Queue listener
//!
//! Consumes raw deliveries from a transport bridge, parses the wire
//! message, deduplicates START_TASKs on task id within a sliding window,
//! mints a trace id when the message omits one, and hands the result to
//! the root agent. Acknowledgement goes back on successful handoff;
//! processing errors are negative-acked without requeue so a poison
//! message cannot loop.

use std::collections::{HashSet, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actors::{CompletionSender, RootHandle, TaskEnvelope};
use crate::domain::new_trace_id;

use super::messages::WireMessage;

/// Recent START_TASK ids kept for deduplication
const DEDUP_WINDOW: usize = 256;

/// Decision returned to the transport bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAck {
    Ack,
    /// Negative-ack without requeue
    Reject,
}

/// One raw delivery from the transport
#[derive(Debug)]
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub ack: oneshot::Sender<DeliveryAck>,
}

impl InboundDelivery {
    pub fn new(payload: impl Into<Vec<u8>>) -> (Self, oneshot::Receiver<DeliveryAck>) {
        let (ack, rx) = oneshot::channel();
        (
            Self {
                payload: payload.into(),
                ack,
            },
            rx,
        )
    }
}

/// Run the listener until the delivery channel closes
///
/// `default_agent_id` targets messages whose schedule_meta names no agent;
/// `results` receives TASK_RESULT / TASK_PAUSED completions.
pub async fn run_listener(
    mut deliveries: mpsc::Receiver<InboundDelivery>,
    root: RootHandle,
    default_agent_id: String,
    results: CompletionSender,
) {
    info!("QueueListener: started");
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_order: VecDeque<String> = VecDeque::new();

    while let Some(delivery) = deliveries.recv().await {
        let decision = handle_delivery(
            &delivery.payload,
            &root,
            &default_agent_id,
            &results,
            &mut seen_ids,
            &mut seen_order,
        )
        .await;
        let _ = delivery.ack.send(decision);
    }
    info!("QueueListener: stopped");
}

async fn handle_delivery(
    payload: &[u8],
    root: &RootHandle,
    default_agent_id: &str,
    results: &CompletionSender,
    seen_ids: &mut HashSet<String>,
    seen_order: &mut VecDeque<String>,
) -> DeliveryAck {
    let message: WireMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "QueueListener: unparseable message rejected");
            return DeliveryAck::Reject;
        }
    };

    match message {
        WireMessage::StartTask {
            task_id,
            trace_id,
            user_input,
            user_id,
            schedule_meta,
        } => {
            // At-least-once delivery: duplicates inside the window are
            // acknowledged without a second handoff.
            if seen_ids.contains(&task_id) {
                debug!(%task_id, "QueueListener: duplicate START_TASK dropped");
                return DeliveryAck::Ack;
            }
            remember(task_id.clone(), seen_ids, seen_order);

            // Identifier hygiene: a missing trace id is minted fresh,
            // never borrowed from the task id.
            let trace_id = trace_id.unwrap_or_else(new_trace_id);

            let envelope = TaskEnvelope {
                task_id: task_id.clone(),
                trace_id,
                task_path: "/0".to_string(),
                agent_id: schedule_meta
                    .agent_id
                    .unwrap_or_else(|| default_agent_id.to_string()),
                user_id: user_id.unwrap_or_else(|| "system".to_string()),
                content: user_input,
                parameters: schedule_meta.input_params,
                operation_hint: None,
            };

            match root.task(envelope, results.clone()).await {
                Ok(()) => DeliveryAck::Ack,
                Err(e) => {
                    warn!(%task_id, error = %e, "QueueListener: handoff failed");
                    DeliveryAck::Reject
                }
            }
        }
        WireMessage::ResumeTask {
            task_id, parameters, ..
        } => match root.resume(task_id.clone(), parameters, results.clone()).await {
            Ok(()) => DeliveryAck::Ack,
            Err(e) => {
                warn!(%task_id, error = %e, "QueueListener: resume handoff failed");
                DeliveryAck::Reject
            }
        },
    }
}

fn remember(task_id: String, seen_ids: &mut HashSet<String>, seen_order: &mut VecDeque<String>) {
    seen_ids.insert(task_id.clone());
    seen_order.push_back(task_id);
    while seen_order.len() > DEDUP_WINDOW {
        if let Some(oldest) = seen_order.pop_front() {
            seen_ids.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::RootMsg;

    async fn listener_fixture() -> (
        mpsc::Sender<InboundDelivery>,
        mpsc::Receiver<RootMsg>,
        mpsc::Receiver<crate::actors::Completion>,
    ) {
        let (root, root_rx) = RootHandle::channel();
        let (delivery_tx, delivery_rx) = mpsc::channel(16);
        let (results_tx, results_rx) = mpsc::channel(16);
        tokio::spawn(run_listener(delivery_rx, root, "assistant".to_string(), results_tx));
        (delivery_tx, root_rx, results_rx)
    }

    #[tokio::test]
    async fn test_start_task_handoff_and_ack() {
        let (deliveries, mut root_rx, _results) = listener_fixture().await;

        let (delivery, ack) = InboundDelivery::new(
            r#"{"msg_type": "START_TASK", "task_id": "T1", "user_input": "run weekly report"}"#,
        );
        deliveries.send(delivery).await.unwrap();

        match root_rx.recv().await.unwrap() {
            RootMsg::Task { envelope, .. } => {
                assert_eq!(envelope.task_id, "T1");
                assert_eq!(envelope.task_path, "/0");
                assert_eq!(envelope.agent_id, "assistant");
                // Minted trace id, never the task id
                assert_ne!(envelope.trace_id, "T1");
                assert!(envelope.trace_id.starts_with("trace-"));
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(ack.await.unwrap(), DeliveryAck::Ack);
    }

    #[tokio::test]
    async fn test_supplied_trace_id_is_kept() {
        let (deliveries, mut root_rx, _results) = listener_fixture().await;

        let (delivery, ack) = InboundDelivery::new(
            r#"{"msg_type": "START_TASK", "task_id": "T2", "trace_id": "trace-abc", "user_input": "x"}"#,
        );
        deliveries.send(delivery).await.unwrap();

        match root_rx.recv().await.unwrap() {
            RootMsg::Task { envelope, .. } => assert_eq!(envelope.trace_id, "trace-abc"),
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(ack.await.unwrap(), DeliveryAck::Ack);
    }

    #[tokio::test]
    async fn test_duplicate_start_task_acked_once() {
        let (deliveries, mut root_rx, _results) = listener_fixture().await;

        let raw = r#"{"msg_type": "START_TASK", "task_id": "T3", "user_input": "x"}"#;
        let (first, first_ack) = InboundDelivery::new(raw);
        let (second, second_ack) = InboundDelivery::new(raw);
        deliveries.send(first).await.unwrap();
        deliveries.send(second).await.unwrap();

        assert_eq!(first_ack.await.unwrap(), DeliveryAck::Ack);
        assert_eq!(second_ack.await.unwrap(), DeliveryAck::Ack);

        // Only one handoff reached the root agent
        assert!(matches!(root_rx.recv().await.unwrap(), RootMsg::Task { .. }));
        assert!(root_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resume_task_handoff() {
        let (deliveries, mut root_rx, _results) = listener_fixture().await;

        let (delivery, ack) = InboundDelivery::new(
            r#"{"msg_type": "RESUME_TASK", "task_id": "T2", "parameters": {"sku": "S1"}}"#,
        );
        deliveries.send(delivery).await.unwrap();

        match root_rx.recv().await.unwrap() {
            RootMsg::Resume { task_id, parameters, .. } => {
                assert_eq!(task_id, "T2");
                assert_eq!(parameters["sku"], "S1");
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(ack.await.unwrap(), DeliveryAck::Ack);
    }

    #[tokio::test]
    async fn test_poison_message_rejected_not_requeued() {
        let (deliveries, mut root_rx, _results) = listener_fixture().await;

        let (delivery, ack) = InboundDelivery::new("this is not json");
        deliveries.send(delivery).await.unwrap();

        assert_eq!(ack.await.unwrap(), DeliveryAck::Reject);
        assert!(root_rx.try_recv().is_err());
    }

    #[test]
    fn test_dedup_window_expires() {
        let mut ids = HashSet::new();
        let mut order = VecDeque::new();
        for n in 0..(DEDUP_WINDOW + 10) {
            remember(format!("task-{n}"), &mut ids, &mut order);
        }
        assert_eq!(order.len(), DEDUP_WINDOW);
        assert!(!ids.contains("task-0"));
        assert!(ids.contains(&format!("task-{}", DEDUP_WINDOW + 9)));
    }
}
