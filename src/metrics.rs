use crate::subscriptions::SubscriptionRole;
use crate::Result;
use prometheus::{
    core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge},
    histogram_opts, opts, Histogram, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

pub const NAMESPACE: &str = "agenda";

/// Container for the service metrics.
pub struct Metrics {
    feed_fetches_total: IntCounterVec,
    digests_total: IntCounterVec,
    subscriptions: IntGaugeVec,
    latest_cycle_timestamp_seconds: IntGauge,
    cycle_duration_seconds: Histogram,
}

impl Metrics {
    /// Creates new Metrics.
    pub fn new() -> Result<Metrics> {
        let feed_fetches_total = IntCounterVec::new(
            opts!("feed_fetches_total", "Total number of calendar feed fetches")
                .namespace(NAMESPACE),
            &["status"],
        )?;

        let digests_total = IntCounterVec::new(
            opts!(
                "digests_total",
                "Total number of scheduled digests by outcome"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let subscriptions = IntGaugeVec::new(
            opts!("subscriptions", "Number of subscription records").namespace(NAMESPACE),
            &["role"],
        )?;

        let latest_cycle_timestamp_seconds = IntGauge::with_opts(
            opts!(
                "latest_cycle_timestamp_seconds",
                "UNIX timestamp seconds of the latest completed digest cycle"
            )
            .namespace(NAMESPACE),
        )?;

        let cycle_duration_seconds = Histogram::with_opts(
            histogram_opts!("cycle_duration_seconds", "Digest cycle duration in seconds")
                .namespace(NAMESPACE),
        )?;

        Ok(Metrics {
            feed_fetches_total,
            digests_total,
            subscriptions,
            latest_cycle_timestamp_seconds,
            cycle_duration_seconds,
        })
    }

    /// Registers the metrics in a prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.feed_fetches_total.clone()))?;
        registry.register(Box::new(self.digests_total.clone()))?;
        registry.register(Box::new(self.subscriptions.clone()))?;
        registry.register(Box::new(self.latest_cycle_timestamp_seconds.clone()))?;
        registry.register(Box::new(self.cycle_duration_seconds.clone()))?;
        Ok(())
    }

    /// Provides access to the feed fetch counter.
    pub fn feed_fetches_total(&self, status: FetchStatus) -> GenericCounter<AtomicU64> {
        self.feed_fetches_total.with_label_values(&[status.as_str()])
    }

    /// Provides access to the digest counter.
    pub fn digests_total(&self, status: DigestStatus) -> GenericCounter<AtomicU64> {
        self.digests_total.with_label_values(&[status.as_str()])
    }

    /// Provides access to the subscription gauge.
    pub fn subscriptions(&self, role: SubscriptionRole) -> GenericGauge<AtomicI64> {
        self.subscriptions.with_label_values(&[role.as_str()])
    }

    /// Provides access to the latest cycle UNIX timestamp gauge.
    pub fn latest_cycle_timestamp_seconds(&self) -> GenericGauge<AtomicI64> {
        self.latest_cycle_timestamp_seconds.clone()
    }

    /// Provides access to the cycle duration histogram.
    pub fn cycle_duration_seconds(&self) -> Histogram {
        self.cycle_duration_seconds.clone()
    }
}

/// Status of a feed fetch.
#[derive(Debug, Copy, Clone)]
pub enum FetchStatus {
    Success,
    Error,
}

impl FetchStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Error => "error",
        }
    }
}

/// Outcome of a scheduled digest for one channel.
#[derive(Debug, Copy, Clone)]
pub enum DigestStatus {
    /// The digest was delivered.
    Sent,
    /// The day was excluded, nothing was sent.
    Excluded,
    /// Resolving or delivering the digest failed.
    Error,
}

impl DigestStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            DigestStatus::Sent => "sent",
            DigestStatus::Excluded => "excluded",
            DigestStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_gather() {
        let metrics = Metrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.feed_fetches_total(FetchStatus::Error).inc();
        metrics.digests_total(DigestStatus::Sent).inc_by(2);
        metrics
            .subscriptions(SubscriptionRole::ExclusionList)
            .set(3);

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();

        assert!(names.contains(&"agenda_feed_fetches_total".to_owned()));
        assert!(names.contains(&"agenda_digests_total".to_owned()));
        assert!(names.contains(&"agenda_subscriptions".to_owned()));
        assert_eq!(metrics.digests_total(DigestStatus::Sent).get(), 2);

        // Registering the same metrics twice is rejected.
        assert!(metrics.register(&registry).is_err());
    }
}
