//! Message domain types and the delivery-status state machine (§4.3).

pub mod core;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Pending,
    Delivered,
    Read,
    Failed,
}

/// Perspective of a stored row: `outgoing` on the sender's copy, `incoming`
/// on the recipient's. Every private send produces one row of each, sharing
/// `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageType {
    Private,
    Public,
}

/// One persisted copy of a message. Private sends exist as a pair of rows
/// sharing `message_id` and differing only in `direction`/`sender_id`
/// versus `recipient_id` ownership semantics — see [`Message::new_private_pair`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Builds the two rows a private send persists: the sender's `outgoing`
    /// copy and the recipient's `incoming` copy, sharing `message_id` (§3,
    /// §4.3.2 step 4).
    pub fn new_private_pair(
        sender_id: String,
        sender_name: String,
        recipient_id: String,
        content: String,
    ) -> (Message, Message) {
        let now = Utc::now();
        let outgoing = Message {
            message_id: Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            recipient_id,
            content,
            message_type: MessageType::Private,
            status: MessageStatus::Sent,
            direction: Direction::Outgoing,
            created_at: now,
            updated_at: now,
            read_at: None,
        };
        let incoming = Message {
            direction: Direction::Incoming,
            ..outgoing.clone()
        };
        (outgoing, incoming)
    }

    /// Public broadcasts persist as `delivered` immediately (§4.3.7) since
    /// there is no per-recipient ack to await — everyone connected gets the
    /// `io.emit`-style broadcast and the backfill query serves the rest.
    pub fn new_public_pair(sender_id: String, sender_name: String, content: String) -> (Message, Message) {
        let now = Utc::now();
        let outgoing = Message {
            message_id: Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            recipient_id: crate::registry::EVERY_ONE_ONLINE.to_string(),
            content,
            message_type: MessageType::Public,
            status: MessageStatus::Delivered,
            direction: Direction::Outgoing,
            created_at: now,
            updated_at: now,
            read_at: None,
        };
        let incoming = Message {
            direction: Direction::Incoming,
            ..outgoing.clone()
        };
        (outgoing, incoming)
    }
}

/// The ordered lifecycle `sent -> pending -> delivered -> read`, plus the
/// terminal `failed` escape hatch reachable from any non-terminal state.
///
/// Returns the statuses a transition *into* `to` may legally come *from*.
pub fn allowed_from_statuses(to: MessageStatus) -> &'static [MessageStatus] {
    match to {
        MessageStatus::Sent => &[],
        MessageStatus::Pending => &[MessageStatus::Sent],
        MessageStatus::Delivered => &[MessageStatus::Pending],
        MessageStatus::Read => &[MessageStatus::Delivered],
        MessageStatus::Failed => &[
            MessageStatus::Sent,
            MessageStatus::Pending,
            MessageStatus::Delivered,
        ],
    }
}

pub fn is_valid_transition(from: MessageStatus, to: MessageStatus) -> bool {
    allowed_from_statuses(to).contains(&from)
}

#[derive(Debug, Clone, Copy)]
pub struct SafeTimeouts {
    pub delivery_timeout: Duration,
    pub per_emit_timeout: Duration,
}

/// §4.3.3's timeout derivation: the per-emit ack window is
/// `min(delivery_timeout - 50ms, 50ms)`, floored so a tiny configured
/// `delivery_timeout` can never produce a negative or zero per-emit budget.
pub fn get_safe_timeouts(delivery_timeout: Duration) -> SafeTimeouts {
    let floor = Duration::from_millis(100);
    let delivery_timeout = delivery_timeout.max(floor);
    let headroom = delivery_timeout
        .checked_sub(Duration::from_millis(50))
        .unwrap_or(Duration::from_millis(50));
    let per_emit_timeout = headroom.min(Duration::from_millis(50));
    SafeTimeouts {
        delivery_timeout,
        per_emit_timeout,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestTimeouts {
    pub handler_timeout: Duration,
    pub delivery: SafeTimeouts,
}

/// §4.3.3: derives `handlerTimeout` and `deliveryTimeout` from an optional
/// client-supplied request timeout. `handlerTimeout = max(clientTimeout -
/// 1000, 100)`; `deliveryTimeout = min(MESSAGE_ACK_TIMEOUT, max(clientTimeout
/// - 2000, 100), 3000)`. With no client hint, both fall back to the
/// configured `message_ack_timeout`.
pub fn get_request_timeouts(client_timeout: Option<Duration>, message_ack_timeout: Duration) -> RequestTimeouts {
    let floor = Duration::from_millis(100);
    let ceiling = Duration::from_secs(3);

    let handler_timeout = match client_timeout {
        Some(c) => c
            .checked_sub(Duration::from_millis(1000))
            .unwrap_or(Duration::ZERO)
            .max(floor),
        None => message_ack_timeout.max(floor),
    };

    let delivery_timeout = match client_timeout {
        Some(c) => {
            let candidate = c
                .checked_sub(Duration::from_millis(2000))
                .unwrap_or(Duration::ZERO)
                .max(floor);
            message_ack_timeout.min(candidate).min(ceiling)
        }
        None => message_ack_timeout.min(ceiling).max(floor),
    };

    RequestTimeouts {
        handler_timeout,
        delivery: get_safe_timeouts(delivery_timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_to_pending_is_valid() {
        assert!(is_valid_transition(MessageStatus::Sent, MessageStatus::Pending));
    }

    #[test]
    fn sent_to_delivered_direct_path_is_rejected() {
        assert!(!is_valid_transition(MessageStatus::Sent, MessageStatus::Delivered));
    }

    #[test]
    fn pending_to_delivered_is_valid() {
        assert!(is_valid_transition(MessageStatus::Pending, MessageStatus::Delivered));
    }

    #[test]
    fn delivered_to_sent_is_invalid() {
        assert!(!is_valid_transition(MessageStatus::Delivered, MessageStatus::Sent));
    }

    #[test]
    fn read_only_reachable_from_delivered() {
        assert!(is_valid_transition(MessageStatus::Delivered, MessageStatus::Read));
        assert!(!is_valid_transition(MessageStatus::Pending, MessageStatus::Read));
        assert!(!is_valid_transition(MessageStatus::Sent, MessageStatus::Read));
    }

    #[test]
    fn failed_reachable_from_any_nonterminal_state() {
        assert!(is_valid_transition(MessageStatus::Sent, MessageStatus::Failed));
        assert!(is_valid_transition(MessageStatus::Pending, MessageStatus::Failed));
        assert!(is_valid_transition(MessageStatus::Delivered, MessageStatus::Failed));
    }

    #[test]
    fn failed_is_terminal() {
        assert!(allowed_from_statuses(MessageStatus::Sent).is_empty());
        assert!(is_valid_transition(MessageStatus::Sent, MessageStatus::Failed));
        // Nothing transitions *out of* failed because no `to` state lists
        // `Failed` as an allowed source.
        for to in [
            MessageStatus::Sent,
            MessageStatus::Pending,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ] {
            assert!(!is_valid_transition(MessageStatus::Failed, to));
        }
    }

    #[test]
    fn per_emit_timeout_floors_at_50ms_for_the_spec_floor_value() {
        let t = get_safe_timeouts(Duration::from_millis(100));
        assert_eq!(t.per_emit_timeout, Duration::from_millis(50));
    }

    #[test]
    fn per_emit_timeout_stays_50ms_for_generous_delivery_timeouts() {
        let t = get_safe_timeouts(Duration::from_secs(3));
        assert_eq!(t.per_emit_timeout, Duration::from_millis(50));
    }

    #[test]
    fn delivery_timeout_below_floor_is_clamped_up() {
        let t = get_safe_timeouts(Duration::from_millis(10));
        assert_eq!(t.delivery_timeout, Duration::from_millis(100));
        assert_eq!(t.per_emit_timeout, Duration::from_millis(50));
    }

    #[test]
    fn request_timeouts_derive_handler_and_delivery_budgets_from_client_hint() {
        let t = get_request_timeouts(Some(Duration::from_millis(5000)), Duration::from_secs(3));
        assert_eq!(t.handler_timeout, Duration::from_millis(4000));
        assert_eq!(t.delivery.delivery_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn request_timeouts_floor_a_tiny_client_hint() {
        let t = get_request_timeouts(Some(Duration::from_millis(500)), Duration::from_secs(3));
        assert_eq!(t.handler_timeout, Duration::from_millis(100));
        assert_eq!(t.delivery.delivery_timeout, Duration::from_millis(100));
    }

    #[test]
    fn request_timeouts_fall_back_to_configured_ack_timeout_without_a_client_hint() {
        let t = get_request_timeouts(None, Duration::from_millis(200));
        assert_eq!(t.handler_timeout, Duration::from_millis(200));
        assert_eq!(t.delivery.delivery_timeout, Duration::from_millis(200));
    }
}
