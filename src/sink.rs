//! Delivery of digests to destination channels.

use crate::calendar::digest::Digest;
use crate::subscriptions::ChannelId;
use crate::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Trait that needs to be implemented by a destination of digests.
#[async_trait]
pub trait DestinationSink: Send + Sync {
    /// Sends `digest` to `channel`. Fails with `Error::ChannelNotFound` if the channel is
    /// unknown to the sink.
    async fn send(&self, channel: ChannelId, digest: &Digest) -> Result<()>;
}

#[async_trait]
impl<T> DestinationSink for Arc<T>
where
    T: DestinationSink + ?Sized,
{
    async fn send(&self, channel: ChannelId, digest: &Digest) -> Result<()> {
        (**self).send(channel, digest).await
    }
}

const EMBED_COLOR: u32 = 0x00FF00;

/// A `DestinationSink` posting digests as embeds to per-channel chat webhooks.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    webhooks: IndexMap<ChannelId, String>,
}

impl WebhookSink {
    /// Creates a new `WebhookSink` from a mapping of channel id to webhook URL.
    pub fn new(destinations: &IndexMap<String, String>) -> Result<WebhookSink> {
        let webhooks: IndexMap<ChannelId, String> = destinations
            .iter()
            .map(|(channel, url)| Ok((channel.parse::<ChannelId>()?, url.clone())))
            .collect::<Result<_>>()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(WebhookSink { client, webhooks })
    }
}

#[async_trait]
impl DestinationSink for WebhookSink {
    async fn send(&self, channel: ChannelId, digest: &Digest) -> Result<()> {
        let url = self
            .webhooks
            .get(&channel)
            .ok_or(Error::ChannelNotFound(channel))?;

        self.client
            .post(url)
            .json(&embed_payload(digest))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| Error::Sink { channel, source })?;

        log::debug!("delivered digest to channel {}", channel);

        Ok(())
    }
}

/// Builds the webhook payload of a digest.
fn embed_payload(digest: &Digest) -> Value {
    let mut embed = json!({
        "title": digest.title,
        "color": EMBED_COLOR,
    });

    if digest.is_empty {
        embed["description"] = json!("Nothing scheduled");
    } else {
        let fields: Vec<Value> = digest
            .entries
            .iter()
            .map(|entry| {
                let value = if entry.location.is_empty() {
                    entry.time_range.clone()
                } else {
                    format!("{}\n{}", entry.time_range, entry.location)
                };

                json!({ "name": entry.name, "value": value, "inline": false })
            })
            .collect();
        embed["fields"] = Value::Array(fields);
    }

    json!({ "embeds": [embed] })
}
