//! User commands acting on subscriptions and day queries.

use crate::calendar::digest::Digest;
use crate::calendar::{DayResolver, ResolvedDay};
use crate::subscriptions::{
    AddOutcome, ChannelId, SubscriptionRecord, SubscriptionRole, Subscriptions,
};
use crate::{Error, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

/// A day requested by a user, relative to today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayQuery {
    Today,
    Tomorrow,
    OffsetDays(i64),
    Invalid(String),
}

impl DayQuery {
    /// Parses `today`, `tomorrow` or an integer offset. An absent or empty query means today.
    pub fn parse(text: Option<&str>) -> DayQuery {
        let text = text.map(str::trim).unwrap_or_default();

        match text.to_lowercase().as_str() {
            "" | "today" => DayQuery::Today,
            "tomorrow" => DayQuery::Tomorrow,
            other => other
                .parse()
                .map(DayQuery::OffsetDays)
                .unwrap_or_else(|_| DayQuery::Invalid(text.to_owned())),
        }
    }

    /// Returns the day this query refers to.
    pub fn resolve(&self, today: NaiveDate) -> Result<NaiveDate> {
        let offset = match self {
            DayQuery::Today => 0,
            DayQuery::Tomorrow => 1,
            DayQuery::OffsetDays(offset) => *offset,
            DayQuery::Invalid(text) => return Err(Error::InvalidDay(text.clone())),
        };

        let days = Days::new(offset.unsigned_abs());
        let day = if offset >= 0 {
            today.checked_add_days(days)
        } else {
            today.checked_sub_days(days)
        };

        day.ok_or_else(|| Error::InvalidDay(offset.to_string()))
    }
}

/// Answer to a day query.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DayReply {
    /// An exclusion list covers the day.
    Excluded { day: NaiveDate },
    /// The digest of the day, possibly announcing a free day.
    Agenda { day: NaiveDate, digest: Digest },
}

/// The command surface of the service.
#[derive(Clone)]
pub struct Commands {
    subscriptions: Arc<Subscriptions>,
    resolver: DayResolver,
}

impl Commands {
    pub fn new(subscriptions: Arc<Subscriptions>, resolver: DayResolver) -> Commands {
        Commands {
            subscriptions,
            resolver,
        }
    }

    /// Registers `url` for `channel`. `role` defaults to an event source.
    pub async fn register_url(
        &self,
        channel: ChannelId,
        url: &str,
        role: Option<&str>,
    ) -> Result<SubscriptionRecord> {
        let url = url.trim();
        match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https" | "webcal") => {}
            _ => return Err(Error::InvalidUrl(url.to_owned())),
        }

        let role = SubscriptionRole::parse(role)?;
        let record = SubscriptionRecord::new(channel, url, role);

        log::info!(
            "registering {} as {} for channel {}",
            record.url,
            role,
            channel
        );

        match self.subscriptions.add(record.clone()).await? {
            AddOutcome::Added => Ok(record),
            AddOutcome::AlreadyExists => Err(Error::DuplicateRecord {
                channel,
                url: record.url,
                role,
            }),
        }
    }

    /// Removes `url` from `channel`, for all roles unless `role` is given. Returns the number
    /// of removed records.
    pub async fn delete_url(
        &self,
        channel: ChannelId,
        url: &str,
        role: Option<&str>,
    ) -> Result<usize> {
        let role = match role.map(str::trim) {
            None | Some("") => None,
            Some(role) => Some(SubscriptionRole::parse(Some(role))?),
        };

        let removed = self.subscriptions.remove(channel, url.trim(), role).await?;

        log::info!("removed {} records of {} from channel {}", removed, url, channel);

        Ok(removed)
    }

    /// Lists all registrations of `channel`.
    pub async fn list_registrations(&self, channel: ChannelId) -> Vec<SubscriptionRecord> {
        self.subscriptions.records_for_channel(channel, None).await
    }

    /// Answers a day query for `channel`, relative to the current date in the reference
    /// timezone.
    pub async fn query_day(&self, channel: ChannelId, query: &DayQuery) -> Result<DayReply> {
        let today = Utc::now().with_timezone(&self.resolver.timezone()).date_naive();
        self.query_day_from(channel, query, today).await
    }

    /// Answers a day query for `channel` relative to `today`.
    pub async fn query_day_from(
        &self,
        channel: ChannelId,
        query: &DayQuery,
        today: NaiveDate,
    ) -> Result<DayReply> {
        let day = query.resolve(today)?;

        log::info!("events requested in channel {} for {}", channel, day);

        if self.list_registrations(channel).await.is_empty() {
            return Err(Error::NoSubscriptions(channel));
        }

        let reply = match self.resolver.resolve(channel, day).await {
            ResolvedDay::Excluded => DayReply::Excluded { day },
            ResolvedDay::Events(events) => DayReply::Agenda {
                day,
                digest: Digest::new(day, &events),
            },
        };

        Ok(reply)
    }
}
