use tracing::debug;

use super::{publish_with_fallback, MessageState};
use crate::broker::events::{message_key, BrokerEvent, MessageFrame};
use crate::models::Group;

/// Fan a group message out to every member except the sender: one broker
/// event per recipient, each copy stamped with that member's `receiver_id`
/// so the per-connection gateway routing applies unchanged.
///
/// Runs as a spawned task after the HTTP response; publish failures degrade
/// individual recipients to best-effort and never surface to the sender.
pub async fn fan_out(state: MessageState, frame: MessageFrame, group: Group) {
    let sender_hex = frame.sender_id.clone();
    let mut delivered = 0usize;

    for member in &group.member_ids {
        if member.to_hex() == sender_hex {
            continue;
        }

        let mut copy = frame.clone();
        copy.receiver_id = Some(member.to_hex());

        publish_with_fallback(
            &state.broker,
            &message_key(member),
            &BrokerEvent::Message(copy),
        )
        .await;
        delivered += 1;
    }

    debug!(
        group_id = ?frame.group_id,
        message_id = %frame.id,
        recipients = delivered,
        "Group fan-out complete"
    );
}
