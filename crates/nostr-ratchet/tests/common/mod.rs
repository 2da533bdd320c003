#![allow(dead_code)]

//! In-process relay stand-in for integration tests: stores events with
//! replaceable-event retention and fans published events out to matching
//! subscriptions. Events are delivered live only; subscribing does not
//! replay the store, so callbacks never re-enter the subscriber's own
//! locks mid-subscribe.

use nostr::{Event, Filter};
use nostr_ratchet::{match_filter, EventCallback, Subscribe, Unsubscribe};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const REPLACEABLE_RANGE: std::ops::Range<u16> = 10000..20000;

#[derive(Default)]
struct RelayInner {
    events: Vec<Event>,
    subscriptions: HashMap<u64, (Filter, Arc<EventCallback>)>,
    next_subscription_id: u64,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The subscribe capability handed to sessions and invites.
    pub fn subscriber(&self) -> Subscribe {
        let relay = self.clone();
        Arc::new(move |filter: Filter, callback: EventCallback| {
            let id = {
                let mut inner = relay.inner.lock().unwrap();
                let id = inner.next_subscription_id;
                inner.next_subscription_id += 1;
                inner.subscriptions.insert(id, (filter, Arc::new(callback)));
                id
            };
            let relay = relay.clone();
            let unsubscribe: Unsubscribe = Box::new(move || {
                relay.inner.lock().unwrap().subscriptions.remove(&id);
            });
            unsubscribe
        })
    }

    /// Stores the event (applying replaceable-event retention) and
    /// delivers it to every matching subscription.
    pub fn publish(&self, event: Event) {
        if event.verify().is_err() {
            return;
        }

        let callbacks: Vec<Arc<EventCallback>> = {
            let mut inner = self.inner.lock().unwrap();

            let kind = event.kind.as_u16();
            if REPLACEABLE_RANGE.contains(&kind) {
                let d_tag = d_tag_of(&event);
                inner.events.retain(|stored| {
                    !(stored.pubkey == event.pubkey
                        && stored.kind == event.kind
                        && d_tag_of(stored) == d_tag)
                });
            }
            inner.events.push(event.clone());

            inner
                .subscriptions
                .values()
                .filter(|(filter, _)| match_filter(filter, &event))
                .map(|(_, callback)| callback.clone())
                .collect()
        };

        // Registry lock released: callbacks may resubscribe or publish.
        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn events_of_kind(&self, kind: u16) -> Vec<Event> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.kind.as_u16() == kind)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}

fn d_tag_of(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("d") {
            values.get(1).cloned()
        } else {
            None
        }
    })
}
