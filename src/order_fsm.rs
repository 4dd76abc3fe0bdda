/// Order & Position Lifecycle FSMs
///
/// Every broker order and every position passes through a deterministic set
/// of states. Transitions are validated centrally against an explicit table;
/// an illegal edge is a modeling bug or corrupted state and is always raised,
/// never silently ignored.
///
/// Order state diagram:
/// ```text
///   Created → Sent → Acked → PartFilled → Filled
///      ↓       ↓       ↓         ↓
///   Rejected Unknown  ...   CancelRequested → Cancelled
///
///   Terminal states: Filled, Cancelled, Rejected, Expired
/// ```
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Invalid order transition for {order_id}: {from} → {to}")]
    InvalidOrderTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
    },
    #[error("Invalid position transition for {trade_id}: {from} → {to}")]
    InvalidPositionTransition {
        trade_id: String,
        from: PositionState,
        to: PositionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Intent recorded locally, nothing sent yet
    Created,
    /// Submitted to the broker, no acknowledgement
    Sent,
    /// Broker acknowledged and assigned a broker_order_id
    Acked,
    /// Partial fill reported
    PartFilled,
    /// Fully filled — terminal
    Filled,
    /// Cancel submitted, outcome pending
    CancelRequested,
    /// Cancelled at the broker — terminal
    Cancelled,
    /// Rejected by the broker — terminal
    Rejected,
    /// Expired unfilled — terminal
    Expired,
    /// Broker outcome could not be determined after exhausting retries
    Unknown,
}

impl OrderState {
    pub const ALL: [OrderState; 10] = [
        OrderState::Created,
        OrderState::Sent,
        OrderState::Acked,
        OrderState::PartFilled,
        OrderState::Filled,
        OrderState::CancelRequested,
        OrderState::Cancelled,
        OrderState::Rejected,
        OrderState::Expired,
        OrderState::Unknown,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// The set of states reachable from this state.
    pub fn valid_transitions(&self) -> &'static [OrderState] {
        use OrderState::*;
        match self {
            Created => &[Sent, Rejected],
            Sent => &[Acked, Rejected, Unknown],
            Acked => &[PartFilled, Filled, Cancelled, Rejected, Expired],
            PartFilled => &[Filled, CancelRequested, Cancelled, Expired],
            CancelRequested => &[Cancelled, Filled, Unknown],
            Filled => &[],
            Cancelled => &[],
            Rejected => &[],
            Expired => &[],
            Unknown => &[],
        }
    }

    /// Check if transitioning to `next` is valid. A same-state transition is
    /// always permitted so that replayed broker callbacks are no-ops.
    pub fn can_transition_to(&self, next: &OrderState) -> bool {
        self == next || self.valid_transitions().contains(next)
    }

    /// Normalize a free-text broker status onto this enum. Legacy aliases
    /// from heterogeneous backends map to their modern equivalents; anything
    /// unrecognized is Unknown.
    pub fn from_broker_status(status: &str) -> OrderState {
        use OrderState::*;
        match status.trim().to_uppercase().as_str() {
            "CREATED" | "PENDING" => Created,
            "SENT" | "PLACED" => Sent,
            "ACKED" => Acked,
            "PART_FILLED" | "PARTIAL" | "PARTIALLY_FILLED" => PartFilled,
            "FILLED" | "COMPLETE" => Filled,
            "CANCEL_REQUESTED" => CancelRequested,
            "CANCELLED" | "CANCELED" => Cancelled,
            "REJECTED" => Rejected,
            "EXPIRED" => Expired,
            _ => Unknown,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Planned,
    Opening,
    Open,
    Exiting,
    /// Closed cleanly — terminal
    Closed,
    /// Inconsistent or unrecoverable — terminal, requires operator
    Error,
}

impl PositionState {
    pub const ALL: [PositionState; 6] = [
        PositionState::Planned,
        PositionState::Opening,
        PositionState::Open,
        PositionState::Exiting,
        PositionState::Closed,
        PositionState::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    pub fn valid_transitions(&self) -> &'static [PositionState] {
        use PositionState::*;
        match self {
            Planned => &[Opening, Error],
            Opening => &[Open, Error, Closed],
            Open => &[Exiting, Closed, Error],
            Exiting => &[Closed, Error],
            Closed => &[],
            Error => &[],
        }
    }

    pub fn can_transition_to(&self, next: &PositionState) -> bool {
        self == next || self.valid_transitions().contains(next)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Append-only audit entry recorded for every applied transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub entity_id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub correlation_id: String,
    pub at: DateTime<Utc>,
}

/// Validate an order transition and build its audit record.
///
/// Pure: the caller owns applying the new state and persisting the record.
pub fn order_transition(
    order_id: &str,
    correlation_id: &str,
    from: OrderState,
    to: OrderState,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<TransitionRecord, StateError> {
    if !from.can_transition_to(&to) {
        return Err(StateError::InvalidOrderTransition {
            order_id: order_id.to_string(),
            from,
            to,
        });
    }
    Ok(TransitionRecord {
        entity_id: order_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        reason,
        correlation_id: correlation_id.to_string(),
        at,
    })
}

/// Validate a position transition and build its audit record.
pub fn position_transition(
    trade_id: &str,
    correlation_id: &str,
    from: PositionState,
    to: PositionState,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<TransitionRecord, StateError> {
    if !from.can_transition_to(&to) {
        return Err(StateError::InvalidPositionTransition {
            trade_id: trade_id.to_string(),
            from,
            to,
        });
    }
    Ok(TransitionRecord {
        entity_id: trade_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        reason,
        correlation_id: correlation_id.to_string(),
        at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_edges() -> Vec<(OrderState, OrderState)> {
        use OrderState::*;
        vec![
            (Created, Sent),
            (Created, Rejected),
            (Sent, Acked),
            (Sent, Rejected),
            (Sent, Unknown),
            (Acked, PartFilled),
            (Acked, Filled),
            (Acked, Cancelled),
            (Acked, Rejected),
            (Acked, Expired),
            (PartFilled, Filled),
            (PartFilled, CancelRequested),
            (PartFilled, Cancelled),
            (PartFilled, Expired),
            (CancelRequested, Cancelled),
            (CancelRequested, Filled),
            (CancelRequested, Unknown),
        ]
    }

    #[test]
    fn test_order_table_exhaustive() {
        let allowed = order_edges();
        for from in OrderState::ALL {
            for to in OrderState::ALL {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(&to),
                    expected,
                    "edge {} → {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_order_self_transitions_always_ok() {
        for state in OrderState::ALL {
            assert!(state.can_transition_to(&state), "{} → {}", state, state);
        }
    }

    #[test]
    fn test_order_reversals_rejected() {
        use OrderState::*;
        assert!(!Filled.can_transition_to(&Acked));
        assert!(!Acked.can_transition_to(&Sent));
        assert!(!Cancelled.can_transition_to(&CancelRequested));
    }

    #[test]
    fn test_position_table_exhaustive() {
        use PositionState::*;
        let allowed = vec![
            (Planned, Opening),
            (Planned, Error),
            (Opening, Open),
            (Opening, Error),
            (Opening, Closed),
            (Open, Exiting),
            (Open, Closed),
            (Open, Error),
            (Exiting, Closed),
            (Exiting, Error),
        ];
        for from in PositionState::ALL {
            for to in PositionState::ALL {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(&to), expected, "{} → {}", from, to);
            }
        }
    }

    #[test]
    fn test_invalid_transition_is_typed_error() {
        let err = order_transition(
            "ord-1",
            "corr-1",
            OrderState::Created,
            OrderState::Filled,
            None,
            Utc::now(),
        )
        .unwrap_err();
        match err {
            StateError::InvalidOrderTransition { order_id, from, to } => {
                assert_eq!(order_id, "ord-1");
                assert_eq!(from, OrderState::Created);
                assert_eq!(to, OrderState::Filled);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_transition_record_carries_audit_fields() {
        let rec = order_transition(
            "ord-2",
            "corr-2",
            OrderState::Sent,
            OrderState::Acked,
            Some("broker ack".to_string()),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rec.entity_id, "ord-2");
        assert_eq!(rec.from, "Sent");
        assert_eq!(rec.to, "Acked");
        assert_eq!(rec.correlation_id, "corr-2");
    }

    #[test]
    fn test_legacy_status_mapping() {
        assert_eq!(
            OrderState::from_broker_status("PENDING"),
            OrderState::Created
        );
        assert_eq!(OrderState::from_broker_status("PLACED"), OrderState::Sent);
        assert_eq!(
            OrderState::from_broker_status("partially_filled"),
            OrderState::PartFilled
        );
        assert_eq!(
            OrderState::from_broker_status("COMPLETE"),
            OrderState::Filled
        );
        assert_eq!(
            OrderState::from_broker_status("CANCELED"),
            OrderState::Cancelled
        );
        assert_eq!(
            OrderState::from_broker_status("weird-status"),
            OrderState::Unknown
        );
    }
}
