//! Property-based checks for the universal invariants SPEC_FULL.md §8 lists
//! for the message envelope and the bounded queue. The FSM's exhaustive
//! transition-table invariant is exercised as ordinary unit tests inside
//! `fsm::tests`, where the noop collaborator stubs an `Orchestrator`
//! needs already live.

use orchestrator::message::{Message, MessageContent, MessageQueue};
use proptest::prelude::*;

fn arb_terminal_output() -> impl Strategy<Value = MessageContent> {
    "[a-zA-Z0-9 ]{0,64}".prop_map(|text| MessageContent::TerminalOutput { text })
}

fn arb_progress_indicator() -> impl Strategy<Value = MessageContent> {
    ("[a-zA-Z0-9 ]{0,32}", 0.0f64..=100.0)
        .prop_map(|(title, percentage)| MessageContent::ProgressIndicator { title, percentage })
}

fn arb_well_formed_content() -> impl Strategy<Value = MessageContent> {
    prop_oneof![arb_terminal_output(), arb_progress_indicator()]
}

proptest! {
    /// `construct` -> `to_wire` -> `from_wire` round-trips to an equivalent
    /// message, with id and timestamp preserved, for every well-formed
    /// `(kind, content)` pair.
    #[test]
    fn message_round_trip_preserves_identity(content in arb_well_formed_content()) {
        let msg = Message::construct(content).expect("well-formed content must construct");
        let wire = msg.to_wire().expect("serialization must succeed");
        let back = Message::from_wire(&wire).expect("deserialization must succeed");
        prop_assert_eq!(msg.id, back.id);
        prop_assert_eq!(msg.timestamp, back.timestamp);
        prop_assert_eq!(msg.content, back.content);
    }

    /// Schema-invalid content (an empty `request_id` on `approval_request`)
    /// always fails construction before any I/O, regardless of the other
    /// field values.
    #[test]
    fn invalid_request_id_always_rejected(
        text in "[a-zA-Z0-9 ]{0,32}",
        options in prop::collection::vec("[a-z]{1,8}", 0..5),
    ) {
        let err = Message::construct(MessageContent::ApprovalRequest {
            text,
            options,
            request_id: String::new(),
        })
        .unwrap_err();
        prop_assert_eq!(err.category(), orchestrator::ErrorCategory::Schema);
    }

    /// For any sequence of enqueue/dequeue calls on a capacity-`N` queue,
    /// `dequeued <= enqueued - dropped`, `max_depth <= N`, and `clear`
    /// leaves the cumulative counters untouched.
    #[test]
    fn queue_invariants_hold(
        capacity in 1usize..8,
        ops in prop::collection::vec(prop::bool::ANY, 0..64),
    ) {
        let queue = MessageQueue::new(capacity);
        for enqueue in ops {
            if enqueue {
                let msg = Message::construct(MessageContent::Heartbeat {
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                })
                .unwrap();
                queue.try_enqueue(msg);
            } else {
                queue.try_dequeue();
            }
        }

        let metrics = queue.metrics();
        prop_assert!(metrics.dequeued <= metrics.enqueued.saturating_sub(metrics.dropped));
        prop_assert!(metrics.max_depth <= capacity as u64);

        queue.clear();
        let after_clear = queue.metrics();
        prop_assert_eq!(after_clear.enqueued, metrics.enqueued);
        prop_assert_eq!(after_clear.dequeued, metrics.dequeued);
        prop_assert_eq!(after_clear.dropped, metrics.dropped);
        prop_assert_eq!(queue.len(), 0);
    }
}
