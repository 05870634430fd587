use std::time::Duration;

use futures::StreamExt;
use lapin::options::BasicAckOptions;
use tracing::{info, warn};

use super::GatewayState;
use crate::broker::events::{BrokerEvent, DeliveryTarget};
use crate::broker::QueueSpec;

/// Consume this gateway's durable queue and translate broker events into
/// socket frames for locally connected users.
///
/// Runs for the lifetime of the process: any consume error or stream end
/// (typically a lost broker connection) sleeps 5 seconds and re-enters
/// declare + consume, restoring the queue bindings before consumption
/// resumes.
pub async fn run(state: GatewayState, queue_name: String) {
    let spec = QueueSpec::gateway(&queue_name);

    loop {
        match state.broker.consume(&spec, &queue_name).await {
            Ok(mut consumer) => {
                info!(queue = %queue_name, "Gateway consumer started");
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            dispatch(&state, &delivery.data).await;
                            // Ack unconditionally: a target with no local
                            // connection is handled by another gateway or
                            // nobody, never redelivered here.
                            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                warn!(error = ?e, "Failed to ack gateway delivery");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = ?e, "Gateway consumer stream error");
                            break;
                        }
                    }
                }
                warn!(queue = %queue_name, "Gateway consumer stopped; will resume");
            }
            Err(e) => {
                warn!(queue = %queue_name, error = ?e, "Failed to start gateway consumer");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Decode one delivery and route it per the outbound dispatch table.
async fn dispatch(state: &GatewayState, payload: &[u8]) {
    let event: BrokerEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = ?e, "Dropping undecodable broker event");
            return;
        }
    };

    let frame = match event.client_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = ?e, "Failed to serialize client frame; this is a programming error");
            return;
        }
    };

    match event.delivery_target() {
        DeliveryTarget::User(user_id) => {
            // A miss is normal: the user may be connected to another gateway
            // or offline.
            state.connections.send_to_user(user_id, &frame).await;
        }
        DeliveryTarget::BroadcastExcept(subject) => {
            state.connections.broadcast_except(subject, &frame).await;
        }
        DeliveryTarget::Drop => {}
    }
}
