//! Fetches iCalendar feeds over HTTP.

use super::{local_instant, start_of_day, FeedFetcher, FetchError, RawEvent};
use crate::{FeedsConfig, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use ical::parser::ical::component::IcalEvent;
use ical::property::Property;
use reqwest::header::{HeaderValue, USER_AGENT};
use rrule::{RRuleError, RRuleSet};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

/// A `FeedFetcher` downloading `.ics` files.
#[derive(Debug, Clone)]
pub struct IcsFeedFetcher {
    client: reqwest::Client,
    timezone: Tz,
}

impl IcsFeedFetcher {
    /// Creates a fetcher. All-day events are placed at midnight in `timezone`.
    pub fn new(config: &FeedsConfig, timezone: Tz) -> Result<IcsFeedFetcher> {
        let user_agent = match &config.user_agent {
            Some(user_agent) => user_agent.clone(),
            None => format!("agenda/{}", env!("CARGO_PKG_VERSION")),
        };

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent).unwrap_or(HeaderValue::from_static("agenda")),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(IcsFeedFetcher { client, timezone })
    }
}

#[async_trait]
impl FeedFetcher for IcsFeedFetcher {
    async fn fetch(
        &self,
        url: &str,
        window: Range<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_owned(),
            source,
        };

        let response = self
            .client
            .get(http_url(url))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status,
            });
        }

        let body = response.text().await.map_err(request_error)?;
        let events = parse_feed(url, &body, &window, self.timezone)?;

        log::debug!("fetched {} events from {}", events.len(), url);

        Ok(events)
    }
}

/// Subscription links often use the `webcal` scheme, which is plain HTTPS.
fn http_url(url: &str) -> String {
    match url.strip_prefix("webcal://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_owned(),
    }
}

/// Upper bound of occurrences expanded from a single recurrence rule.
const MAX_OCCURRENCES: u16 = u16::MAX;

/// Parses an iCalendar payload and returns the events overlapping `window`.
///
/// Recurring events are expanded into one event per occurrence. Excluded dates and
/// overridden or cancelled occurrences are honoured.
pub fn parse_feed(
    url: &str,
    body: &str,
    window: &Range<DateTime<Utc>>,
    timezone: Tz,
) -> Result<Vec<RawEvent>, FetchError> {
    let parse_error = |reason: String| FetchError::Parse {
        url: url.to_owned(),
        reason,
    };

    let mut events = Vec::new();
    let mut calendars = 0;

    for calendar in ical::IcalParser::new(body.as_bytes()) {
        let calendar = calendar.map_err(|err| parse_error(err.to_string()))?;
        calendars += 1;

        let feed_events: Vec<FeedEvent> = calendar
            .events
            .iter()
            .filter_map(FeedEvent::from_ical)
            .collect();

        // Occurrences replaced by a separate component, keyed by UID.
        let mut overridden: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
        for event in &feed_events {
            if let (Some(uid), Some(recurrence_id)) = (&event.uid, event.recurrence_id) {
                overridden
                    .entry(uid.as_str())
                    .or_default()
                    .push(recurrence_id.to_utc(timezone));
            }
        }

        for event in feed_events.iter().filter(|event| !event.cancelled) {
            let overrides = event
                .uid
                .as_deref()
                .and_then(|uid| overridden.get(uid))
                .map_or(&[][..], Vec::as_slice);

            events.extend(
                event
                    .occurrences(window, timezone, overrides)
                    .into_iter()
                    .filter(|event| overlaps(event, window)),
            );
        }
    }

    if calendars == 0 {
        return Err(parse_error("no calendar found".into()));
    }

    Ok(events)
}

fn overlaps(event: &RawEvent, window: &Range<DateTime<Utc>>) -> bool {
    if event.start == event.end {
        return window.contains(&event.start);
    }

    event.start < window.end && event.end > window.start
}

/// A DTSTART, DTEND, EXDATE, RDATE or RECURRENCE-ID value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timepoint {
    Date(NaiveDate),
    /// A local time in the given zone. UTC and floating times use `chrono_tz::UTC`.
    DateTime(NaiveDateTime, Tz),
}

impl Timepoint {
    fn to_utc(self, timezone: Tz) -> DateTime<Utc> {
        match self {
            Timepoint::Date(date) => start_of_day(timezone, date).with_timezone(&Utc),
            Timepoint::DateTime(naive, zone) => local_instant(zone, naive).with_timezone(&Utc),
        }
    }

    /// Formats the value as a DTSTART line understood by the recurrence rule parser.
    fn dtstart_line(self, timezone: Tz) -> String {
        match self {
            Timepoint::Date(date) => format!(
                "DTSTART;TZID={}:{}",
                timezone.name(),
                date.format("%Y%m%dT000000")
            ),
            Timepoint::DateTime(naive, zone) if zone == chrono_tz::UTC => {
                format!("DTSTART:{}Z", naive.format("%Y%m%dT%H%M%S"))
            }
            Timepoint::DateTime(naive, zone) => format!(
                "DTSTART;TZID={}:{}",
                zone.name(),
                naive.format("%Y%m%dT%H%M%S")
            ),
        }
    }
}

/// The properties of a VEVENT component relevant for the agenda.
#[derive(Debug, Clone)]
struct FeedEvent {
    uid: Option<String>,
    summary: String,
    location: String,
    start: Timepoint,
    end: Timepoint,
    rrule: Option<String>,
    rdates: Vec<Timepoint>,
    exdates: Vec<Timepoint>,
    recurrence_id: Option<Timepoint>,
    cancelled: bool,
}

impl FeedEvent {
    /// Returns `None` for events without a start.
    fn from_ical(event: &IcalEvent) -> Option<FeedEvent> {
        let mut uid = None;
        let mut summary = String::new();
        let mut location = String::new();
        let mut start = None;
        let mut end = None;
        let mut rrule = None;
        let mut rdates = Vec::new();
        let mut exdates = Vec::new();
        let mut recurrence_id = None;
        let mut cancelled = false;

        for property in &event.properties {
            match property.name.as_str() {
                "UID" => uid = Some(text_value(property)),
                "SUMMARY" => summary = text_value(property),
                "LOCATION" => location = text_value(property),
                "DTSTART" => start = parse_timepoint(property),
                "DTEND" => end = parse_timepoint(property),
                "RRULE" => rrule = property.value.as_deref().map(|v| v.trim().to_owned()),
                "RDATE" => rdates.extend(parse_timepoints(property)),
                "EXDATE" => exdates.extend(parse_timepoints(property)),
                "RECURRENCE-ID" => recurrence_id = parse_timepoint(property),
                "STATUS" => cancelled = text_value(property).eq_ignore_ascii_case("CANCELLED"),
                _ => {}
            }
        }

        let start = start?;
        let end = match (start, end) {
            (_, Some(end)) => end,
            // An all-day event without end lasts one day.
            (Timepoint::Date(date), None) => Timepoint::Date(date.checked_add_days(Days::new(1))?),
            (Timepoint::DateTime(..), None) => start,
        };

        Some(FeedEvent {
            uid,
            summary,
            location,
            start,
            end,
            rrule,
            rdates,
            exdates,
            recurrence_id,
            cancelled,
        })
    }

    /// Returns all occurrences starting before the end of `window`, skipping excluded and
    /// `overridden` start instants.
    fn occurrences(
        &self,
        window: &Range<DateTime<Utc>>,
        timezone: Tz,
        overridden: &[DateTime<Utc>],
    ) -> Vec<RawEvent> {
        let first = self.start.to_utc(timezone);

        // Overrides replace a single occurrence and never recur themselves.
        if self.recurrence_id.is_some() || (self.rrule.is_none() && self.rdates.is_empty()) {
            return vec![self.occurrence(first, timezone)];
        }

        let mut starts = match &self.rrule {
            Some(rule) => expand_rule(self.start, rule, window.end, timezone).unwrap_or_else(
                |err| {
                    log::debug!("failed to expand recurrence of {}: {err}", self.summary);
                    vec![first]
                },
            ),
            None => vec![first],
        };
        starts.extend(self.rdates.iter().map(|rdate| rdate.to_utc(timezone)));
        starts.sort();
        starts.dedup();

        let excluded: Vec<DateTime<Utc>> = self
            .exdates
            .iter()
            .map(|exdate| exdate.to_utc(timezone))
            .chain(overridden.iter().copied())
            .collect();

        starts
            .into_iter()
            .filter(|start| *start < window.end && !excluded.contains(start))
            .map(|start| self.occurrence(start, timezone))
            .collect()
    }

    /// Builds the occurrence starting at `start`, keeping the duration of the first one.
    fn occurrence(&self, start: DateTime<Utc>, timezone: Tz) -> RawEvent {
        let end = match (self.start, self.end) {
            // All-day events span whole days, whatever the length of those days.
            (Timepoint::Date(first), Timepoint::Date(last)) => {
                let days = last.signed_duration_since(first).num_days().max(0);
                start
                    .with_timezone(&timezone)
                    .date_naive()
                    .checked_add_days(Days::new(days.unsigned_abs()))
                    .map_or(start, |day| start_of_day(timezone, day).with_timezone(&Utc))
            }
            (first, last) => {
                let duration = last.to_utc(timezone) - first.to_utc(timezone);
                start + duration.max(chrono::Duration::zero())
            }
        };

        RawEvent {
            summary: self.summary.clone(),
            location: self.location.clone(),
            start,
            end: end.max(start),
        }
    }
}

/// Expands `rule` from `start` into the UTC start instants before `until`.
fn expand_rule(
    start: Timepoint,
    rule: &str,
    until: DateTime<Utc>,
    timezone: Tz,
) -> Result<Vec<DateTime<Utc>>, RRuleError> {
    let set: RRuleSet = format!("{}\nRRULE:{}", start.dtstart_line(timezone), rule).parse()?;

    let dates = set
        .before(until.with_timezone(&rrule::Tz::UTC))
        .all(MAX_OCCURRENCES)
        .dates;

    Ok(dates
        .into_iter()
        .map(|date| date.with_timezone(&Utc))
        .collect())
}

fn param<'a>(property: &'a Property, name: &str) -> Option<&'a str> {
    property
        .params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))?
        .1
        .first()
        .map(String::as_str)
}

fn parse_timepoint(property: &Property) -> Option<Timepoint> {
    parse_timepoint_value(property, property.value.as_deref()?)
}

/// Parses a property holding a comma separated list of values.
fn parse_timepoints(property: &Property) -> Vec<Timepoint> {
    property
        .value
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|value| parse_timepoint_value(property, value))
        .collect()
}

fn parse_timepoint_value(property: &Property, value: &str) -> Option<Timepoint> {
    let value = value.trim();

    let is_date = param(property, "VALUE").map_or(false, |v| v.eq_ignore_ascii_case("DATE"))
        || value.len() == 8;
    if is_date {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(Timepoint::Date);
    }

    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").ok()?;
        return Some(Timepoint::DateTime(naive, chrono_tz::UTC));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;

    let zone = param(property, "TZID").and_then(|tzid| {
        let tzid = tzid.trim_matches('"').trim_start_matches('/');
        let zone = tzid.parse::<Tz>().ok();
        if zone.is_none() {
            log::debug!("unknown timezone {tzid}, assuming UTC");
        }
        zone
    });

    // Floating times and unknown zones are taken as UTC.
    Some(Timepoint::DateTime(naive, zone.unwrap_or(chrono_tz::UTC)))
}

fn text_value(property: &Property) -> String {
    unescape(property.value.as_deref().unwrap_or_default().trim())
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}
