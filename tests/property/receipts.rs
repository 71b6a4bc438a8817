//! Property-based tests for the receipt ledger.
//!
//! Uses proptest to verify:
//! 1. A message's status never moves backwards, whatever order receipts
//!    arrive in, and ends at the highest status reported.
//! 2. Receipt timestamps are set once and never overwritten.
//! 3. Applying the same bulk-seen batch twice changes nothing the second time.
//! 4. Arbitrary frames never panic the inbound decoder.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use courier::receipts::ReceiptLedger;
use courier_proto::codec;
use courier_proto::event::SeenItem;
use courier_proto::message::{Message, MessageId, MessageStatus, PeerRef, Timestamp};

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Seen),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = Option<Timestamp>> {
    prop::option::of((0i64..1_000_000).prop_map(|secs| {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }))
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn message(id: i64) -> Message {
    Message {
        id: MessageId::new(id),
        text: format!("message {id}"),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        status: MessageStatus::Sent,
        delivered_at: None,
        seen_at: None,
        sender: PeerRef::new(1, "alice"),
        receiver: PeerRef::new(2, "bob"),
    }
}

fn ledger_with(ids: impl IntoIterator<Item = i64>) -> ReceiptLedger {
    let mut ledger = ReceiptLedger::new();
    ledger.load_history(ids.into_iter().map(message));
    ledger
}

proptest! {
    #[test]
    fn status_is_monotonic(updates in prop::collection::vec((arb_status(), arb_timestamp()), 0..24)) {
        let mut ledger = ledger_with([1]);
        let id = MessageId::new(1);
        let mut previous = ledger.status(id).unwrap();

        for (status, ts) in &updates {
            ledger.apply_update(id, *status, *ts, now());
            let current = ledger.status(id).unwrap();
            prop_assert!(current >= previous);
            previous = current;
        }

        let highest = updates
            .iter()
            .map(|(s, _)| *s)
            .max()
            .unwrap_or(MessageStatus::Sent);
        prop_assert_eq!(previous, highest);
    }

    #[test]
    fn final_status_ignores_arrival_order(
        updates in prop::collection::vec(arb_status(), 1..12).prop_shuffle()
    ) {
        let mut forward = ledger_with([1]);
        let mut backward = ledger_with([1]);
        let id = MessageId::new(1);
        for status in &updates {
            forward.apply_update(id, *status, None, now());
        }
        for status in updates.iter().rev() {
            backward.apply_update(id, *status, None, now());
        }
        prop_assert_eq!(forward.status(id), backward.status(id));
    }

    #[test]
    fn timestamps_are_set_once(updates in prop::collection::vec((arb_status(), arb_timestamp()), 0..24)) {
        let mut ledger = ledger_with([1]);
        let id = MessageId::new(1);
        let mut delivered_at = None;
        let mut seen_at = None;

        for (status, ts) in updates {
            ledger.apply_update(id, status, ts, now());
            let stored = ledger.get(id).unwrap();

            if let Some(earlier) = delivered_at {
                prop_assert_eq!(stored.delivered_at, Some(earlier));
            }
            if let Some(earlier) = seen_at {
                prop_assert_eq!(stored.seen_at, Some(earlier));
            }
            if stored.status >= MessageStatus::Delivered {
                prop_assert!(stored.delivered_at.is_some());
            }
            if stored.status == MessageStatus::Seen {
                prop_assert!(stored.seen_at.is_some());
            }
            delivered_at = stored.delivered_at;
            seen_at = stored.seen_at;
        }
    }

    #[test]
    fn bulk_seen_is_idempotent(
        known in prop::collection::btree_set(1i64..50, 0..16),
        batch in prop::collection::vec((1i64..60, arb_timestamp()), 0..24),
    ) {
        let mut ledger = ledger_with(known.iter().copied());
        let items: Vec<SeenItem> = batch
            .into_iter()
            .map(|(id, ts)| SeenItem { id: MessageId::new(id), ts })
            .collect();

        let first = ledger.apply_bulk_seen(&items, now());
        for id in &first {
            prop_assert!(known.contains(&id.get()));
            prop_assert_eq!(ledger.status(*id), Some(MessageStatus::Seen));
        }
        let snapshot = ledger.messages().to_vec();

        let second = ledger.apply_bulk_seen(&items, now());
        prop_assert!(second.is_empty());
        prop_assert_eq!(ledger.messages(), snapshot.as_slice());
    }

    #[test]
    fn decode_never_panics_on_arbitrary_text(frame in ".{0,512}") {
        let _ = codec::decode_inbound(&frame);
    }
}
