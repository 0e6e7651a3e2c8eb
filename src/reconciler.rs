//! Message list reconciliation
//!
//! Folds batches from the three chat sources (history fetch, push channel,
//! periodic poll) into one displayed list. Every function here returns a list
//! that is sorted ascending by `Message::sort_key` (stable for ties) and has
//! no repeated ids.

use crate::message::Message;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Where an incoming batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    History,
    Push,
    Poll,
}

/// What the poll may do with messages authored by the current user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnMessagePolicy {
    /// Own messages in the poll are ignored; the local copy is authoritative
    #[default]
    KeepLocal,
    /// Own messages with unknown ids are adopted, unless a placeholder with
    /// the same text is still pending (the ack will bring that one in)
    AdoptFromOtherDevices,
}

/// Merge `incoming` into `current`
///
/// `incoming == None` stands for a malformed batch and leaves the list as it is.
pub fn merge(
    current: &[Message],
    incoming: Option<Vec<Message>>,
    source: Source,
    policy: OwnMessagePolicy,
) -> Vec<Message> {
    let Some(incoming) = incoming else {
        debug!(?source, "malformed batch, keeping current list");
        return current.to_vec();
    };

    match source {
        Source::History => replace(incoming),
        Source::Push => {
            let mut merged = current.to_vec();
            for msg in incoming {
                merged = push(&merged, msg);
            }
            merged
        }
        Source::Poll => poll(current, incoming, policy),
    }
}

/// Full replacement (initial load)
pub fn replace(incoming: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut list: Vec<Message> = incoming
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    sort(&mut list);
    list
}

/// Append one pushed message if it is new and not self-originated
pub fn push(current: &[Message], msg: Message) -> Vec<Message> {
    let mut list = current.to_vec();
    if msg.is_mine() {
        trace!(id = %msg.id, "ignoring self-originated push");
        return list;
    }
    if list.iter().any(|m| m.id == msg.id) {
        trace!(id = %msg.id, "push already displayed");
        return list;
    }
    list.push(msg);
    sort(&mut list);
    list
}

fn poll(current: &[Message], incoming: Vec<Message>, policy: OwnMessagePolicy) -> Vec<Message> {
    let mut list = current.to_vec();
    let mut known: HashSet<String> = list.iter().map(|m| m.id.clone()).collect();
    let pending_texts: Vec<&str> = current
        .iter()
        .filter(|m| m.is_temporary())
        .map(|m| m.text.as_str())
        .collect();

    let mut added = 0usize;
    for msg in incoming {
        if msg.is_mine() {
            let adopt = policy == OwnMessagePolicy::AdoptFromOtherDevices
                && !msg.is_temporary()
                && !pending_texts.contains(&msg.text.as_str());
            if !adopt {
                continue;
            }
        }
        if !known.insert(msg.id.clone()) {
            continue;
        }
        list.push(msg);
        added += 1;
    }

    if added > 0 {
        debug!(added, "poll brought new messages");
        sort(&mut list);
    }
    list
}

/// Swap a placeholder for the server-confirmed message
///
/// Any copy of the confirmed id that already arrived through push or poll is
/// dropped first, so exactly one entry carries that id afterwards.
pub fn confirm(current: &[Message], temp_id: &str, confirmed: Message) -> Vec<Message> {
    let mut list: Vec<Message> = current
        .iter()
        .filter(|m| m.id != temp_id && m.id != confirmed.id)
        .cloned()
        .collect();
    list.push(confirmed);
    sort(&mut list);
    list
}

/// Insert a locally authored entry (placeholder)
pub fn insert_local(current: &[Message], msg: Message) -> Vec<Message> {
    let mut list: Vec<Message> = current.iter().filter(|m| m.id != msg.id).cloned().collect();
    list.push(msg);
    sort(&mut list);
    list
}

/// Drop one entry by id
pub fn discard(current: &[Message], id: &str) -> Vec<Message> {
    current.iter().filter(|m| m.id != id).cloned().collect()
}

fn sort(list: &mut [Message]) {
    // sort_by_key is stable, so equal timestamps keep insertion order
    list.sort_by_key(Message::sort_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Sender, Status};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn msg(id: &str, secs: i64, sender: Sender) -> Message {
        Message {
            id: id.to_string(),
            text: format!("body {}", id),
            sent_at: Some(t(secs)),
            received_at: t(0),
            sender,
            status: Status::Sent,
            file: None,
        }
    }

    fn ids(list: &[Message]) -> Vec<&str> {
        list.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_history_replaces_and_sorts() {
        let current = vec![msg("old", 0, Sender::Other)];
        let incoming = vec![
            msg("b", 20, Sender::Me),
            msg("a", 10, Sender::Other),
            msg("a", 10, Sender::Other),
        ];
        let merged = merge(&current, Some(incoming), Source::History, OwnMessagePolicy::KeepLocal);
        assert_eq!(ids(&merged), vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_batch_is_noop() {
        let current = vec![msg("1", 0, Sender::Other)];
        for source in [Source::History, Source::Push, Source::Poll] {
            let merged = merge(&current, None, source, OwnMessagePolicy::KeepLocal);
            assert_eq!(merged, current);
        }
    }

    #[test]
    fn test_poll_scenario_no_duplicate() {
        let current = vec![msg("1", 1, Sender::Other)];
        let batch = vec![msg("1", 1, Sender::Other), msg("2", 2, Sender::Other)];
        let merged = merge(&current, Some(batch), Source::Poll, OwnMessagePolicy::KeepLocal);
        assert_eq!(ids(&merged), vec!["1", "2"]);
    }

    #[test]
    fn test_poll_keeps_local_own_messages() {
        let placeholder = Message {
            id: "temp-1".to_string(),
            ..msg("x", 5, Sender::Me)
        };
        let current = vec![msg("1", 1, Sender::Other), placeholder.clone()];
        // Poll lags: it knows nothing about the placeholder but has an
        // own message with a server id.
        let batch = vec![msg("1", 1, Sender::Other), msg("99", 5, Sender::Me)];
        let merged = merge(&current, Some(batch), Source::Poll, OwnMessagePolicy::KeepLocal);
        assert_eq!(ids(&merged), vec!["1", "temp-1"]);
        assert_eq!(merged[1], placeholder);
    }

    #[test]
    fn test_poll_adopts_other_device_messages_when_enabled() {
        let current = vec![msg("1", 1, Sender::Other)];
        let batch = vec![msg("1", 1, Sender::Other), msg("50", 3, Sender::Me)];
        let merged = merge(
            &current,
            Some(batch),
            Source::Poll,
            OwnMessagePolicy::AdoptFromOtherDevices,
        );
        assert_eq!(ids(&merged), vec!["1", "50"]);
    }

    #[test]
    fn test_poll_adoption_skips_pending_echo() {
        let mut placeholder = msg("temp-9", 5, Sender::Me);
        placeholder.text = "see you".to_string();
        let mut echo = msg("77", 5, Sender::Me);
        echo.text = "see you".to_string();

        let current = vec![placeholder];
        let merged = merge(
            &current,
            Some(vec![echo]),
            Source::Poll,
            OwnMessagePolicy::AdoptFromOtherDevices,
        );
        assert_eq!(ids(&merged), vec!["temp-9"]);
    }

    #[test]
    fn test_push_appends_and_resorts() {
        let current = vec![msg("1", 1, Sender::Other), msg("3", 30, Sender::Me)];
        let merged = merge(
            &current,
            Some(vec![msg("2", 20, Sender::Other)]),
            Source::Push,
            OwnMessagePolicy::KeepLocal,
        );
        assert_eq!(ids(&merged), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_push_ignores_duplicate_id() {
        let current = vec![msg("1", 1, Sender::Other)];
        let merged = push(&current, msg("1", 1, Sender::Other));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_self_push_suppressed() {
        let mut optimistic = msg("temp-5", 5, Sender::Me);
        optimistic.text = "hello".to_string();
        let mut echo = msg("12", 5, Sender::Me);
        echo.text = "hello".to_string();

        let current = vec![optimistic];
        let merged = push(&current, echo);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "temp-5");
    }

    #[test]
    fn test_confirm_replaces_placeholder() {
        let placeholder = Message {
            id: "temp-100".to_string(),
            status: Status::Sending,
            ..msg("p", 10, Sender::Me)
        };
        let current = vec![msg("1", 1, Sender::Other), placeholder];
        let merged = confirm(&current, "temp-100", msg("X", 10, Sender::Me));
        assert_eq!(merged.iter().filter(|m| m.id == "X").count(), 1);
        assert!(!merged.iter().any(|m| m.id.starts_with("temp-")));
    }

    #[test]
    fn test_confirm_after_racing_poll_copy() {
        let placeholder = msg("temp-1", 10, Sender::Me);
        let racing_copy = msg("X", 10, Sender::Me);
        let current = vec![placeholder, racing_copy];
        let merged = confirm(&current, "temp-1", msg("X", 10, Sender::Me));
        assert_eq!(ids(&merged), vec!["X"]);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let current = vec![msg("a", 5, Sender::Other), msg("b", 5, Sender::Other)];
        let merged = push(&current, msg("c", 5, Sender::Other));
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_uses_received_at_fallback() {
        let mut undated = msg("u", 0, Sender::Other);
        undated.sent_at = None;
        undated.received_at = t(15);
        let current = vec![msg("1", 10, Sender::Other), msg("2", 20, Sender::Other)];
        let merged = push(&current, undated);
        assert_eq!(ids(&merged), vec!["1", "u", "2"]);
    }

    #[test]
    fn test_discard() {
        let current = vec![msg("1", 1, Sender::Other), msg("temp-2", 2, Sender::Me)];
        assert_eq!(ids(&discard(&current, "temp-2")), vec!["1"]);
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (0u8..12, 0i64..50, any::<bool>()).prop_map(|(id, secs, mine)| {
            msg(
                &id.to_string(),
                secs,
                if mine { Sender::Me } else { Sender::Other },
            )
        })
    }

    fn arb_step() -> impl Strategy<Value = (Source, Vec<Message>)> {
        (
            prop_oneof![Just(Source::History), Just(Source::Push), Just(Source::Poll)],
            prop::collection::vec(arb_message(), 0..6),
        )
    }

    fn assert_invariants(list: &[Message]) -> Result<(), TestCaseError> {
        let unique: HashSet<_> = list.iter().map(|m| &m.id).collect();
        prop_assert_eq!(unique.len(), list.len());
        for pair in list.windows(2) {
            prop_assert!(pair[0].sort_key() <= pair[1].sort_key());
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_merges_keep_ids_unique_and_sorted(steps in prop::collection::vec(arb_step(), 1..10)) {
            let mut list = Vec::new();
            for (source, batch) in steps {
                list = merge(&list, Some(batch), source, OwnMessagePolicy::KeepLocal);
                assert_invariants(&list)?;
            }
        }

        #[test]
        fn prop_poll_merge_is_idempotent(
            start in prop::collection::vec(arb_message(), 0..8),
            batch in prop::collection::vec(arb_message(), 0..8),
        ) {
            let current = replace(start);
            let once = merge(&current, Some(batch.clone()), Source::Poll, OwnMessagePolicy::KeepLocal);
            let twice = merge(&once, Some(batch), Source::Poll, OwnMessagePolicy::KeepLocal);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_poll_never_touches_own_entries(
            start in prop::collection::vec(arb_message(), 0..8),
            batch in prop::collection::vec(arb_message(), 0..8),
        ) {
            let current = replace(start);
            let merged = merge(&current, Some(batch), Source::Poll, OwnMessagePolicy::KeepLocal);
            let before: Vec<_> = current.iter().filter(|m| m.is_mine()).collect();
            let after: Vec<_> = merged.iter().filter(|m| m.is_mine()).collect();
            prop_assert_eq!(before, after);
        }
    }
}
