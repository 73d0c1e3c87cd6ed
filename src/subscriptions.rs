//! Channel subscriptions to calendar feeds.

use crate::metrics::Metrics;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Opaque identifier of a destination channel.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(ChannelId)
            .map_err(|_| Error::InvalidChannelId(s.to_owned()))
    }
}

/// How the events of a subscribed feed are used.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionRole {
    /// Events of the feed populate the digest.
    EventSource,
    /// Any event of the feed on a day suppresses the whole digest of that day.
    ExclusionList,
}

impl SubscriptionRole {
    /// Parses a role given by a user. An absent or empty role means `EventSource`.
    pub fn parse(text: Option<&str>) -> Result<SubscriptionRole> {
        match text.map(str::trim) {
            None | Some("") => Ok(SubscriptionRole::EventSource),
            Some("event_source") => Ok(SubscriptionRole::EventSource),
            Some("exclusion_list") => Ok(SubscriptionRole::ExclusionList),
            Some(other) => Err(Error::UnknownRole(other.to_owned())),
        }
    }

    /// Returns the role as a &str.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionRole::EventSource => "event_source",
            SubscriptionRole::ExclusionList => "exclusion_list",
        }
    }
}

impl fmt::Display for SubscriptionRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// A single channel subscription.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRecord {
    pub channel_id: ChannelId,
    pub url: String,
    pub role: SubscriptionRole,
}

impl SubscriptionRecord {
    pub fn new<S: Into<String>>(
        channel_id: ChannelId,
        url: S,
        role: SubscriptionRole,
    ) -> SubscriptionRecord {
        SubscriptionRecord {
            channel_id,
            url: url.into(),
            role,
        }
    }

    fn matches(&self, channel_id: ChannelId, role: Option<SubscriptionRole>) -> bool {
        self.channel_id == channel_id && role.map_or(true, |role| self.role == role)
    }
}

/// Outcome of adding a record to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyExists,
}

/// Whole-collection persistence for subscription records.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Loads all records, or `None` if nothing was persisted yet.
    async fn load_all(&self) -> Result<Option<Vec<SubscriptionRecord>>>;

    /// Replaces the persisted collection with `records`.
    async fn save_all(&self, records: &[SubscriptionRecord]) -> Result<()>;
}

/// A `DurableStore` keeping records as a JSON array in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> JsonFileStore {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn load_all(&self) -> Result<Option<Vec<SubscriptionRecord>>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| Error::StoreCorruption {
                path: self.path.clone(),
                source,
            })
    }

    async fn save_all(&self, records: &[SubscriptionRecord]) -> Result<()> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.tmp_path();

        // Replace the store in one step so readers never see a partial file.
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl<T> DurableStore for Arc<T>
where
    T: DurableStore + ?Sized,
{
    async fn load_all(&self) -> Result<Option<Vec<SubscriptionRecord>>> {
        (**self).load_all().await
    }

    async fn save_all(&self, records: &[SubscriptionRecord]) -> Result<()> {
        (**self).save_all(records).await
    }
}

/// The registry of all subscriptions.
///
/// Mutations hold the lock while the full collection is written to the durable store, so
/// concurrent adds and removes never lose each other's updates. The write and the in-memory
/// update run in a task of their own and complete even if the caller is cancelled.
pub struct Subscriptions {
    store: Arc<dyn DurableStore>,
    records: Arc<Mutex<Vec<SubscriptionRecord>>>,
    metrics: Option<Arc<Metrics>>,
}

impl Subscriptions {
    /// Opens the registry, loading any previously persisted records.
    pub async fn open<S>(store: S) -> Result<Subscriptions>
    where
        S: DurableStore + 'static,
    {
        let records = store.load_all().await?.unwrap_or_default();

        log::info!("loaded {} subscription records", records.len());

        Ok(Subscriptions {
            store: Arc::new(store),
            records: Arc::new(Mutex::new(records)),
            metrics: None,
        })
    }

    /// Reports subscription counts to `metrics` from now on.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Subscriptions {
        if let Ok(records) = self.records.try_lock() {
            update_gauges(&metrics, &records);
        }
        self.metrics = Some(metrics);
        self
    }

    /// Adds a record unless the same channel, role and URL triple is already registered.
    pub async fn add(&self, record: SubscriptionRecord) -> Result<AddOutcome> {
        let records = self.records.clone().lock_owned().await;

        if records.contains(&record) {
            log::warn!(
                "{} is already registered as {} for channel {}",
                record.url,
                record.role,
                record.channel_id
            );
            return Ok(AddOutcome::AlreadyExists);
        }

        let mut updated = records.clone();
        updated.push(record);
        self.commit(records, updated).await?;

        Ok(AddOutcome::Added)
    }

    /// Removes all records of `channel_id` with the given URL, narrowed to `role` if given.
    /// Returns the number of removed records.
    pub async fn remove(
        &self,
        channel_id: ChannelId,
        url: &str,
        role: Option<SubscriptionRole>,
    ) -> Result<usize> {
        let records = self.records.clone().lock_owned().await;

        let updated: Vec<_> = records
            .iter()
            .filter(|record| !(record.matches(channel_id, role) && record.url == url))
            .cloned()
            .collect();

        let removed = records.len() - updated.len();
        if removed > 0 {
            self.commit(records, updated).await?;
        }

        Ok(removed)
    }

    /// Returns the records of a channel in insertion order, filtered by `role` if given.
    pub async fn records_for_channel(
        &self,
        channel_id: ChannelId,
        role: Option<SubscriptionRole>,
    ) -> Vec<SubscriptionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|record| record.matches(channel_id, role))
            .cloned()
            .collect()
    }

    /// Returns all channels with at least one record.
    pub async fn channels(&self) -> BTreeSet<ChannelId> {
        self.records
            .lock()
            .await
            .iter()
            .map(|record| record.channel_id)
            .collect()
    }

    /// Persists `updated` and then replaces the records behind `records` with it.
    async fn commit(
        &self,
        mut records: OwnedMutexGuard<Vec<SubscriptionRecord>>,
        updated: Vec<SubscriptionRecord>,
    ) -> Result<()> {
        let store = self.store.clone();
        let metrics = self.metrics.clone();

        let task = tokio::spawn(async move {
            store.save_all(&updated).await?;
            *records = updated;

            if let Some(metrics) = &metrics {
                update_gauges(metrics, &records);
            }
            Ok::<_, Error>(())
        });

        task.await.map_err(io::Error::from)?
    }
}

fn update_gauges(metrics: &Metrics, records: &[SubscriptionRecord]) {
    for role in [SubscriptionRole::EventSource, SubscriptionRole::ExclusionList] {
        let count = records.iter().filter(|record| record.role == role).count();
        metrics.subscriptions(role).set(count as i64);
    }
}
