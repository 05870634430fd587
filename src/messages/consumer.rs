use std::time::Duration;

use bson::{doc, oid::ObjectId};
use chrono::Utc;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tracing::{info, warn};

use super::{publish_with_fallback, MessageState};
use crate::broker::events::{status_key, BrokerEvent, StatusFrame};
use crate::broker::QueueSpec;
use crate::error::{AppError, AppResult};
use crate::models::MessageStatus;

/// Consume the message service's inbound queue and drive the automatic
/// sent → delivered transition: the broker handing the persisted event back
/// is the signal that the downstream side has accepted it.
///
/// Rejected deliveries (undecodable payloads, store failures) are nacked
/// without requeue, which routes them to the dead-letter exchange. Runs for
/// the lifetime of the process with a 5 second re-subscribe backoff.
pub async fn run(state: MessageState) {
    let spec = QueueSpec::message_events();

    loop {
        match state.broker.consume(&spec, "message-service").await {
            Ok(mut consumer) => {
                info!(queue = %spec.name, "Auto-deliver consumer started");
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            let outcome = mark_delivered(&state, &delivery.data).await;
                            let ack_result = match outcome {
                                Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                                Err(e) => {
                                    warn!(error = ?e, "Rejecting delivery to dead-letter exchange");
                                    delivery
                                        .nack(BasicNackOptions {
                                            requeue: false,
                                            ..Default::default()
                                        })
                                        .await
                                }
                            };
                            if let Err(e) = ack_result {
                                warn!(error = ?e, "Failed to settle delivery");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = ?e, "Auto-deliver consumer stream error");
                            break;
                        }
                    }
                }
                warn!(queue = %spec.name, "Auto-deliver consumer stopped; will resume");
            }
            Err(e) => {
                warn!(queue = %spec.name, error = ?e, "Failed to start auto-deliver consumer");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Flip a freshly published message to `delivered` and emit the per-message
/// status event.
///
/// Idempotent under at-least-once delivery and group fan-out: the update is
/// filtered on `status == "sent"`, so duplicates and sibling copies find
/// nothing to modify and are acked silently.
async fn mark_delivered(state: &MessageState, payload: &[u8]) -> AppResult<()> {
    let event: BrokerEvent = serde_json::from_slice(payload)
        .map_err(|_| AppError::Validation("Undecodable broker payload".into()))?;

    // The fallback publish path funnels other event kinds into this queue
    // during exchange outages; they carry nothing for this consumer.
    let BrokerEvent::Message(frame) = event else {
        return Ok(());
    };

    let message_id = ObjectId::parse_str(&frame.id)
        .map_err(|_| AppError::Validation("Malformed message id in event".into()))?;

    let now = Utc::now();
    let result = state
        .store
        .messages()
        .update_one(
            doc! { "_id": message_id, "status": "sent" },
            doc! {
                "$set": {
                    "status": "delivered",
                    "updated_at": bson::DateTime::from_chrono(now),
                }
            },
        )
        .await?;

    if result.modified_count == 0 {
        // Already delivered or read — a redelivery or a sibling fan-out copy.
        return Ok(());
    }

    let status_event = BrokerEvent::MessageStatus(StatusFrame {
        message_id: frame.id.clone(),
        status: MessageStatus::Delivered,
        updated_at: now,
        sender_id: Some(frame.sender_id.clone()),
        receiver_id: frame.receiver_id.clone(),
    });
    publish_with_fallback(&state.broker, &status_key(&message_id), &status_event).await;

    Ok(())
}
