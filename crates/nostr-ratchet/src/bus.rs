//! The event-bus contract this crate consumes.
//!
//! Sessions and invites never talk to a relay directly. They are handed a
//! [`Subscribe`] capability: call it with a filter and a callback, get back
//! an owned [`Unsubscribe`] handle. Dropping or invoking the handle ends
//! the subscription; invoking it twice is harmless because the closure is
//! consumed on first use. Publishing stays with the caller.

use nostr::{Event, Filter, Kind, PublicKey};
use nostr::types::filter::{Alphabet, SingleLetterTag};
use serde_json::Value;
use std::sync::Arc;

/// Cancels one subscription. Consumed on first call, so cancellation is
/// idempotent by construction.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Invoked by the bus with every event matching the subscribed filter.
pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

/// The subscribe capability: `subscribe(filter, on_event) -> unsubscribe`.
pub type Subscribe = Arc<dyn Fn(Filter, EventCallback) -> Unsubscribe + Send + Sync>;

/// Helper to build the filters this crate subscribes with.
pub fn build_filter() -> FilterBuilder {
    FilterBuilder::new()
}

pub struct FilterBuilder {
    kinds: Vec<Kind>,
    authors: Vec<PublicKey>,
    pubkeys: Vec<PublicKey>,
    identifier: Option<String>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self {
            kinds: Vec::new(),
            authors: Vec::new(),
            pubkeys: Vec::new(),
            identifier: None,
        }
    }

    pub fn kinds(mut self, kinds: Vec<u64>) -> Self {
        self.kinds = kinds.into_iter().map(|k| Kind::from(k as u16)).collect();
        self
    }

    pub fn authors(mut self, authors: Vec<PublicKey>) -> Self {
        self.authors = authors;
        self
    }

    /// Becomes a `"#p"` tag filter.
    pub fn pubkeys(mut self, pubkeys: Vec<PublicKey>) -> Self {
        self.pubkeys = pubkeys;
        self
    }

    /// Becomes a `"#d"` tag filter, for replaceable events.
    pub fn identifier(mut self, d_tag: impl Into<String>) -> Self {
        self.identifier = Some(d_tag.into());
        self
    }

    pub fn build(self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds);
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors);
        }
        if !self.pubkeys.is_empty() {
            filter = filter.pubkeys(self.pubkeys);
        }
        if let Some(d_tag) = self.identifier {
            filter = filter.custom_tag(SingleLetterTag::lowercase(Alphabet::D), [d_tag]);
        }
        filter
    }
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Total filter predicate over signed events: `kinds`, `authors`, `ids`,
/// `since`/`until` and single-letter tag filters (`"#p"`, `"#d"`, …).
/// Anything unrecognized in the filter is ignored rather than rejected.
pub fn match_filter(filter: &Filter, event: &Event) -> bool {
    let (Ok(filter_json), Ok(event_json)) =
        (serde_json::to_value(filter), serde_json::to_value(event))
    else {
        return false;
    };
    let (Some(filter_obj), Some(event_obj)) = (filter_json.as_object(), event_json.as_object())
    else {
        return false;
    };

    for (key, expected) in filter_obj {
        let matched = match key.as_str() {
            "ids" => value_in_list(event_obj.get("id"), expected),
            "kinds" => value_in_list(event_obj.get("kind"), expected),
            "authors" => value_in_list(event_obj.get("pubkey"), expected),
            "since" => timestamp_cmp(event_obj, expected, |created, bound| created >= bound),
            "until" => timestamp_cmp(event_obj, expected, |created, bound| created <= bound),
            "limit" | "search" => true,
            tag_key if tag_key.starts_with('#') => {
                event_has_tag_value(event_obj, &tag_key[1..], expected)
            }
            _ => true,
        };
        if !matched {
            return false;
        }
    }
    true
}

fn value_in_list(actual: Option<&Value>, expected: &Value) -> bool {
    let (Some(actual), Some(list)) = (actual, expected.as_array()) else {
        return false;
    };
    list.iter().any(|candidate| candidate == actual)
}

fn timestamp_cmp(
    event: &serde_json::Map<String, Value>,
    bound: &Value,
    cmp: impl Fn(u64, u64) -> bool,
) -> bool {
    match (
        event.get("created_at").and_then(Value::as_u64),
        bound.as_u64(),
    ) {
        (Some(created), Some(bound)) => cmp(created, bound),
        _ => false,
    }
}

fn event_has_tag_value(
    event: &serde_json::Map<String, Value>,
    tag_name: &str,
    expected: &Value,
) -> bool {
    let (Some(tags), Some(wanted)) = (
        event.get("tags").and_then(Value::as_array),
        expected.as_array(),
    ) else {
        return false;
    };

    tags.iter().any(|tag| {
        let Some(tag) = tag.as_array() else {
            return false;
        };
        tag.first().and_then(Value::as_str) == Some(tag_name)
            && tag
                .get(1)
                .map(|value| wanted.iter().any(|w| w == value))
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag};

    fn signed_event(keys: &Keys, kind: u16, content: &str, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::from(kind), content, tags)
            .to_unsigned_event(keys.public_key())
            .sign(keys)
            .unwrap()
    }

    #[test]
    fn matches_kind_and_author() {
        let keys = Keys::generate();
        let event = signed_event(&keys, 1060, "x", vec![]);

        let filter = build_filter()
            .kinds(vec![1060])
            .authors(vec![keys.public_key()])
            .build();
        assert!(match_filter(&filter, &event));

        let other = Keys::generate();
        let filter = build_filter()
            .kinds(vec![1060])
            .authors(vec![other.public_key()])
            .build();
        assert!(!match_filter(&filter, &event));

        let filter = build_filter().kinds(vec![1059]).build();
        assert!(!match_filter(&filter, &event));
    }

    #[test]
    fn matches_p_tag() {
        let keys = Keys::generate();
        let target = Keys::generate().public_key();
        let tag = Tag::parse(&["p".to_string(), hex::encode(target.to_bytes())]).unwrap();
        let event = signed_event(&keys, 1059, "x", vec![tag]);

        let filter = build_filter()
            .kinds(vec![1059])
            .pubkeys(vec![target])
            .build();
        assert!(match_filter(&filter, &event));

        let filter = build_filter()
            .kinds(vec![1059])
            .pubkeys(vec![Keys::generate().public_key()])
            .build();
        assert!(!match_filter(&filter, &event));
    }

    #[test]
    fn matches_d_tag() {
        let keys = Keys::generate();
        let tag = Tag::parse(&["d".to_string(), "double-ratchet/invite-list".to_string()]).unwrap();
        let event = signed_event(&keys, 10078, "", vec![tag]);

        let filter = build_filter()
            .kinds(vec![10078])
            .identifier("double-ratchet/invite-list")
            .build();
        assert!(match_filter(&filter, &event));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let keys = Keys::generate();
        let event = signed_event(&keys, 1, "x", vec![]);
        assert!(match_filter(&Filter::new(), &event));
    }
}
