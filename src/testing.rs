//! Fakes shared by the unit tests.

use crate::calendar::digest::Digest;
use crate::calendar::{FeedFetcher, FetchError, RawEvent};
use crate::sink::DestinationSink;
use crate::subscriptions::{ChannelId, DurableStore, SubscriptionRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A `DurableStore` keeping everything in memory and counting writes.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<Option<Vec<SubscriptionRecord>>>,
    pub saves: AtomicUsize,
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_all(&self) -> Result<Option<Vec<SubscriptionRecord>>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn save_all(&self, records: &[SubscriptionRecord]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.records.lock().unwrap() = Some(records.to_vec());
        Ok(())
    }
}

/// A `FeedFetcher` serving fixed events per URL, filtered to the requested window. Unknown
/// URLs fail to parse.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    feeds: HashMap<String, Vec<RawEvent>>,
    calls: Mutex<Vec<(String, Range<DateTime<Utc>>)>>,
}

impl FakeFetcher {
    pub fn with_feed(mut self, url: &str, events: Vec<RawEvent>) -> FakeFetcher {
        self.feeds.insert(url.to_owned(), events);
        self
    }

    /// Number of fetches of `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| called == url)
            .count()
    }

    /// All requested windows in call order.
    pub fn windows(&self) -> Vec<Range<DateTime<Utc>>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, window)| window.clone())
            .collect()
    }
}

#[async_trait]
impl FeedFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        window: Range<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_owned(), window.clone()));

        let events = self.feeds.get(url).ok_or_else(|| FetchError::Parse {
            url: url.to_owned(),
            reason: "no such feed".into(),
        })?;

        Ok(events
            .iter()
            .filter(|event| event.start < window.end && event.end > window.start)
            .cloned()
            .collect())
    }
}

/// A `DestinationSink` recording every digest. Channels not marked as known are missing.
#[derive(Default)]
pub(crate) struct RecordingSink {
    known: HashSet<ChannelId>,
    sent: Mutex<Vec<(ChannelId, Digest)>>,
}

impl RecordingSink {
    pub fn with_channel(mut self, channel: u64) -> RecordingSink {
        self.known.insert(ChannelId(channel));
        self
    }

    pub fn sent(&self) -> Vec<(ChannelId, Digest)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationSink for RecordingSink {
    async fn send(&self, channel: ChannelId, digest: &Digest) -> Result<()> {
        if !self.known.contains(&channel) {
            return Err(Error::ChannelNotFound(channel));
        }

        self.sent.lock().unwrap().push((channel, digest.clone()));
        Ok(())
    }
}

/// Builds a `RawEvent` from RFC 3339 timestamps.
pub(crate) fn raw_event(summary: &str, start: &str, end: &str) -> RawEvent {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);

    RawEvent {
        summary: summary.into(),
        location: String::new(),
        start: parse(start),
        end: parse(end),
    }
}
