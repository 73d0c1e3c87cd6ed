pub mod digest;
pub mod ics;

use crate::metrics::{FetchStatus, Metrics};
use crate::subscriptions::{ChannelId, SubscriptionRecord, SubscriptionRole, Subscriptions};
use async_trait::async_trait;
use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// Represents a single calendar event in the reference timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The event title.
    pub summary: String,
    /// Where the event takes place, empty if unknown.
    pub location: String,
    /// The start of the event.
    pub start: DateTime<Tz>,
    /// The end of the event, never before `start`.
    pub end: DateTime<Tz>,
}

impl Event {
    /// Returns `true` if `day` lies between the calendar dates of start and end, inclusive.
    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start.date_naive() <= day && day <= self.end.date_naive()
    }

    /// Returns `true` if the two events overlap, touching boundaries included.
    pub fn intersects(&self, other: &Event) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.summary.fmt(f)
    }
}

/// An event as delivered by a feed, before timezone normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub summary: String,
    pub location: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Error while fetching a feed. Always carries the URL of the feed.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The feed could not be requested.
    #[error("failed to request feed {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The feed server answered with an error status.
    #[error("feed {url} responded with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    /// The feed payload is not a valid calendar.
    #[error("failed to parse feed {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    /// The URL of the feed that failed.
    pub fn url(&self) -> &str {
        match self {
            FetchError::Request { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Parse { url, .. } => url,
        }
    }
}

/// Trait that needs to be implemented by a source of calendar feeds.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetches the events of the feed at `url` overlapping `window`.
    async fn fetch(
        &self,
        url: &str,
        window: Range<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>, FetchError>;
}

#[async_trait]
impl<T> FeedFetcher for Box<T>
where
    T: FeedFetcher + ?Sized,
{
    async fn fetch(
        &self,
        url: &str,
        window: Range<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>, FetchError> {
        (**self).fetch(url, window).await
    }
}

#[async_trait]
impl<T> FeedFetcher for Arc<T>
where
    T: FeedFetcher + ?Sized,
{
    async fn fetch(
        &self,
        url: &str,
        window: Range<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>, FetchError> {
        (**self).fetch(url, window).await
    }
}

/// Maps a local date and time to an instant in `tz`.
///
/// Ambiguous times resolve to the earlier instant. Times inside a DST gap move forward to the
/// first valid minute after the gap.
pub fn local_instant(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut candidate = naive;

    // Gaps are at most a few hours long; a day of minutes is a generous bound.
    for _ in 0..24 * 60 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => return dt,
            LocalResult::None => candidate += chrono::Duration::minutes(1),
        }
    }

    tz.from_utc_datetime(&naive)
}

/// Returns the first instant of `day` in `tz`.
pub fn start_of_day(tz: Tz, day: NaiveDate) -> DateTime<Tz> {
    local_instant(tz, day.and_time(chrono::NaiveTime::MIN))
}

/// Returns the UTC window `[day, day + 1)` in `tz`.
pub fn day_window(tz: Tz, day: NaiveDate) -> Range<DateTime<Utc>> {
    let next_day = day.checked_add_days(Days::new(1)).unwrap_or(day);
    start_of_day(tz, day).with_timezone(&Utc)..start_of_day(tz, next_day).with_timezone(&Utc)
}

/// Fetches the events of the feed at `url` on `day`, converted to `timezone` and sorted by
/// start.
pub async fn fetch_day_events(
    fetcher: &dyn FeedFetcher,
    url: &str,
    day: NaiveDate,
    timezone: Tz,
) -> Result<Vec<Event>, FetchError> {
    let mut events: Vec<Event> = fetcher
        .fetch(url, day_window(timezone, day))
        .await?
        .into_iter()
        .map(|raw| Event {
            summary: raw.summary,
            location: raw.location,
            start: raw.start.with_timezone(&timezone),
            end: raw.end.max(raw.start).with_timezone(&timezone),
        })
        .collect();

    events.sort_by_key(|event| event.start);

    Ok(events)
}

/// The events of a channel on a single day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDay {
    /// An exclusion list marks the day, nothing should be reported.
    Excluded,
    /// The events of all event sources, possibly none.
    Events(Vec<Event>),
}

impl ResolvedDay {
    pub fn is_excluded(&self) -> bool {
        matches!(self, ResolvedDay::Excluded)
    }

    /// The events of the day, empty if the day is excluded.
    pub fn events(&self) -> &[Event] {
        match self {
            ResolvedDay::Excluded => &[],
            ResolvedDay::Events(events) => events,
        }
    }
}

/// Resolves what happens on a given day for a channel by combining all of its feeds.
#[derive(Clone)]
pub struct DayResolver {
    subscriptions: Arc<Subscriptions>,
    fetcher: Arc<dyn FeedFetcher>,
    timezone: Tz,
    metrics: Option<Arc<Metrics>>,
}

impl DayResolver {
    /// Creates a new `DayResolver` computing day boundaries in `timezone`.
    pub fn new<F>(subscriptions: Arc<Subscriptions>, fetcher: F, timezone: Tz) -> DayResolver
    where
        F: FeedFetcher + 'static,
    {
        DayResolver {
            subscriptions,
            fetcher: Arc::new(fetcher),
            timezone,
            metrics: None,
        }
    }

    /// Counts feed fetches in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> DayResolver {
        self.metrics = Some(metrics);
        self
    }

    /// The reference timezone.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Fetches the events of a single feed on `day`, see [`fetch_day_events`].
    pub async fn fetch_day_events(
        &self,
        url: &str,
        day: NaiveDate,
    ) -> Result<Vec<Event>, FetchError> {
        let result = fetch_day_events(&*self.fetcher, url, day, self.timezone).await;

        if let Some(metrics) = &self.metrics {
            let status = match result {
                Ok(_) => FetchStatus::Success,
                Err(_) => FetchStatus::Error,
            };
            metrics.feed_fetches_total(status).inc();
        }

        result
    }

    /// Resolves the events of `channel_id` on `day`.
    ///
    /// Feeds that fail to load count as feeds without events.
    pub async fn resolve(&self, channel_id: ChannelId, day: NaiveDate) -> ResolvedDay {
        let exclusions = self
            .subscriptions
            .records_for_channel(channel_id, Some(SubscriptionRole::ExclusionList))
            .await;

        for record in &exclusions {
            let events = self.fetch_or_warn(record, day).await;

            if events.iter().any(|event| event.contains_day(day)) {
                log::info!(
                    "{} is excluded for channel {} by {}",
                    day,
                    channel_id,
                    record.url
                );
                return ResolvedDay::Excluded;
            }
        }

        let sources = self
            .subscriptions
            .records_for_channel(channel_id, Some(SubscriptionRole::EventSource))
            .await;

        let mut events = Vec::new();
        for record in &sources {
            events.extend(self.fetch_or_warn(record, day).await);
        }

        log::debug!(
            "resolved {} events on {} for channel {}",
            events.len(),
            day,
            channel_id
        );

        ResolvedDay::Events(events)
    }

    async fn fetch_or_warn(&self, record: &SubscriptionRecord, day: NaiveDate) -> Vec<Event> {
        self.fetch_day_events(&record.url, day)
            .await
            .unwrap_or_else(|err| {
                log::warn!(
                    "ignoring {} of channel {}: {err}",
                    record.role,
                    record.channel_id
                );
                Vec::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw_event, FakeFetcher, MemoryStore};

    macro_rules! date {
        ($y:expr, $m:expr, $d:expr) => {
            NaiveDate::from_ymd_opt($y, $m, $d).unwrap()
        };
    }

    fn cet(s: &str) -> DateTime<Tz> {
        DateTime::parse_from_rfc3339(s)
            .unwrap()
            .with_timezone(&chrono_tz::CET)
    }

    async fn resolver(
        fetcher: Arc<FakeFetcher>,
        records: &[(u64, &str, SubscriptionRole)],
    ) -> DayResolver {
        let subscriptions = Subscriptions::open(MemoryStore::default()).await.unwrap();
        for (channel, url, role) in records {
            subscriptions
                .add(SubscriptionRecord::new(ChannelId(*channel), *url, *role))
                .await
                .unwrap();
        }

        DayResolver::new(Arc::new(subscriptions), fetcher, chrono_tz::CET)
    }

    #[test]
    fn event_contains_day() {
        let event = Event {
            summary: "Trip".into(),
            location: String::new(),
            start: cet("2026-10-19T22:00:00+02:00"),
            end: cet("2026-10-21T08:00:00+02:00"),
        };

        assert!(!event.contains_day(date!(2026, 10, 18)));
        assert!(event.contains_day(date!(2026, 10, 19)));
        assert!(event.contains_day(date!(2026, 10, 20)));
        assert!(event.contains_day(date!(2026, 10, 21)));
        assert!(!event.contains_day(date!(2026, 10, 22)));
    }

    #[test]
    fn event_intersects() {
        let event = |start: &str, end: &str| Event {
            summary: "e".into(),
            location: String::new(),
            start: cet(start),
            end: cet(end),
        };

        let a = event("2026-10-20T09:00:00+02:00", "2026-10-20T10:00:00+02:00");
        let b = event("2026-10-20T09:30:00+02:00", "2026-10-20T11:00:00+02:00");
        let c = event("2026-10-20T10:00:00+02:00", "2026-10-20T12:00:00+02:00");
        let d = event("2026-10-20T12:30:00+02:00", "2026-10-20T13:00:00+02:00");

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(a.intersects(&c));
        assert!(!a.intersects(&d));
        assert!(!d.intersects(&a));
    }

    #[test]
    fn day_window_in_reference_timezone() {
        // Summer time, CET is UTC+2.
        let window = day_window(chrono_tz::CET, date!(2026, 7, 1));
        assert_eq!(window.start.to_rfc3339(), "2026-06-30T22:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2026-07-01T22:00:00+00:00");

        // The day DST ends is 25 hours long.
        let window = day_window(chrono_tz::CET, date!(2026, 10, 25));
        assert_eq!(window.end - window.start, chrono::Duration::hours(25));
    }

    #[test]
    fn local_instant_skips_dst_gap() {
        // 02:30 does not exist on 2026-03-29 in CET.
        let naive = date!(2026, 3, 29).and_hms_opt(2, 30, 0).unwrap();
        let instant = local_instant(chrono_tz::CET, naive);

        assert_eq!(instant.to_rfc3339(), "2026-03-29T03:00:00+02:00");
    }

    #[actix_rt::test]
    async fn fetch_day_events_sorts_and_normalizes() {
        let fetcher = Arc::new(FakeFetcher::default().with_feed(
            "https://x/cal.ics",
            vec![
                raw_event("c", "2026-01-15T13:00:00Z", "2026-01-15T14:00:00Z"),
                raw_event("a", "2026-01-15T08:00:00Z", "2026-01-15T09:00:00Z"),
                raw_event("b", "2026-01-15T10:00:00Z", "2026-01-15T11:00:00Z"),
            ],
        ));
        let resolver = resolver(fetcher.clone(), &[]).await;

        let events = resolver
            .fetch_day_events("https://x/cal.ics", date!(2026, 1, 15))
            .await
            .unwrap();

        let starts: Vec<_> = events
            .iter()
            .map(|event| event.start.format("%H:%M").to_string())
            .collect();
        assert_eq!(starts, ["09:00", "11:00", "14:00"]);
        assert_eq!(events[0].start.timezone(), chrono_tz::CET);

        assert_eq!(
            fetcher.windows(),
            vec![day_window(chrono_tz::CET, date!(2026, 1, 15))]
        );
    }

    #[actix_rt::test]
    async fn fetch_day_events_reports_url() {
        let resolver = resolver(Arc::new(FakeFetcher::default()), &[]).await;

        let err = resolver
            .fetch_day_events("https://x/missing.ics", date!(2026, 1, 15))
            .await
            .unwrap_err();

        assert_eq!(err.url(), "https://x/missing.ics");
    }

    #[actix_rt::test]
    async fn resolve_without_records_is_a_free_day() {
        let resolver = resolver(Arc::new(FakeFetcher::default()), &[]).await;

        assert_eq!(
            resolver.resolve(ChannelId(1), date!(2026, 10, 20)).await,
            ResolvedDay::Events(vec![])
        );
    }

    #[actix_rt::test]
    async fn resolve_with_empty_exclusion_list() {
        use SubscriptionRole::*;

        let fetcher = Arc::new(
            FakeFetcher::default()
                .with_feed(
                    "https://x/courses.ics",
                    vec![RawEvent {
                        location: "A1".into(),
                        ..raw_event("Math", "2026-10-20T07:00:00Z", "2026-10-20T08:00:00Z")
                    }],
                )
                .with_feed("https://x/holidays.ics", vec![]),
        );
        let resolver = resolver(
            fetcher,
            &[
                (42, "https://x/courses.ics", EventSource),
                (42, "https://x/holidays.ics", ExclusionList),
            ],
        )
        .await;

        let resolved = resolver.resolve(ChannelId(42), date!(2026, 10, 20)).await;

        assert_eq!(
            resolved,
            ResolvedDay::Events(vec![Event {
                summary: "Math".into(),
                location: "A1".into(),
                start: cet("2026-10-20T09:00:00+02:00"),
                end: cet("2026-10-20T10:00:00+02:00"),
            }])
        );
    }

    #[actix_rt::test]
    async fn exclusion_skips_event_sources() {
        use SubscriptionRole::*;

        let fetcher = Arc::new(
            FakeFetcher::default()
                .with_feed(
                    "https://x/courses.ics",
                    vec![raw_event("Math", "2026-10-20T07:00:00Z", "2026-10-20T08:00:00Z")],
                )
                .with_feed(
                    "https://x/holidays.ics",
                    vec![raw_event("Holiday", "2026-10-19T22:00:00Z", "2026-10-20T22:00:00Z")],
                ),
        );
        let resolver = resolver(
            fetcher.clone(),
            &[
                (42, "https://x/courses.ics", EventSource),
                (42, "https://x/holidays.ics", ExclusionList),
            ],
        )
        .await;

        let resolved = resolver.resolve(ChannelId(42), date!(2026, 10, 20)).await;

        assert!(resolved.is_excluded());
        assert!(resolved.events().is_empty());
        assert_eq!(fetcher.calls("https://x/holidays.ics"), 1);
        assert_eq!(fetcher.calls("https://x/courses.ics"), 0);
    }

    #[actix_rt::test]
    async fn exclusion_events_on_other_days_do_not_exclude() {
        use SubscriptionRole::*;

        let fetcher = Arc::new(
            FakeFetcher::default()
                .with_feed(
                    "https://x/courses.ics",
                    vec![raw_event("Math", "2026-10-20T07:00:00Z", "2026-10-20T08:00:00Z")],
                )
                .with_feed(
                    "https://x/holidays.ics",
                    vec![raw_event("Holiday", "2026-10-22T08:00:00Z", "2026-10-22T09:00:00Z")],
                ),
        );
        let resolver = resolver(
            fetcher,
            &[
                (42, "https://x/courses.ics", EventSource),
                (42, "https://x/holidays.ics", ExclusionList),
            ],
        )
        .await;

        let resolved = resolver.resolve(ChannelId(42), date!(2026, 10, 20)).await;

        assert!(!resolved.is_excluded());
        assert_eq!(resolved.events().len(), 1);
    }

    #[actix_rt::test]
    async fn failing_feeds_do_not_abort_resolution() {
        use SubscriptionRole::*;

        let fetcher = Arc::new(FakeFetcher::default().with_feed(
            "https://x/courses.ics",
            vec![raw_event("Math", "2026-10-20T07:00:00Z", "2026-10-20T08:00:00Z")],
        ));
        let resolver = resolver(
            fetcher.clone(),
            &[
                (42, "https://x/broken-holidays.ics", ExclusionList),
                (42, "https://x/broken.ics", EventSource),
                (42, "https://x/courses.ics", EventSource),
            ],
        )
        .await;

        let resolved = resolver.resolve(ChannelId(42), date!(2026, 10, 20)).await;

        assert_eq!(resolved.events().len(), 1);
        assert_eq!(fetcher.calls("https://x/broken.ics"), 1);
        assert_eq!(fetcher.calls("https://x/courses.ics"), 1);
    }

    #[actix_rt::test]
    async fn duplicates_across_sources_are_kept() {
        use SubscriptionRole::*;

        let math = vec![raw_event("Math", "2026-10-20T07:00:00Z", "2026-10-20T08:00:00Z")];
        let fetcher = Arc::new(
            FakeFetcher::default()
                .with_feed("https://x/a.ics", math.clone())
                .with_feed("https://x/b.ics", math),
        );
        let resolver = resolver(
            fetcher,
            &[
                (42, "https://x/a.ics", EventSource),
                (42, "https://x/b.ics", EventSource),
                (43, "https://x/a.ics", EventSource),
            ],
        )
        .await;

        let resolved = resolver.resolve(ChannelId(42), date!(2026, 10, 20)).await;

        assert_eq!(resolved.events().len(), 2);
        assert_eq!(resolved.events()[0], resolved.events()[1]);
    }
}
