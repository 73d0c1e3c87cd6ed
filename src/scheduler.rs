use crate::calendar::digest::Digest;
use crate::calendar::{local_instant, DayResolver, ResolvedDay};
use crate::metrics::{DigestStatus, Metrics};
use crate::sink::DestinationSink;
use crate::subscriptions::{ChannelId, Subscriptions};
use crate::Result;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot::{self, Receiver, Sender};
use tokio::task::JoinHandle;

/// Returns the next occurrence of `run_at` strictly after `now`, in the timezone of `now`.
pub fn next_run_after(now: DateTime<Tz>, run_at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = local_instant(tz, today.and_time(run_at));
    if candidate > now {
        return candidate;
    }

    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    local_instant(tz, tomorrow.and_time(run_at))
}

/// Outcome of one digest cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Channels that received a digest.
    pub sent: usize,
    /// Channels whose day was excluded.
    pub excluded: usize,
    /// Channels whose digest could not be delivered.
    pub failed: usize,
}

/// Sends the digest of the following day to every subscribed channel once a day.
#[derive(Clone)]
pub struct Scheduler {
    subscriptions: Arc<Subscriptions>,
    resolver: DayResolver,
    sink: Arc<dyn DestinationSink>,
    run_at: NaiveTime,
    metrics: Option<Arc<Metrics>>,
}

impl Scheduler {
    /// Creates a new `Scheduler` running every day at `run_at` in the resolver's timezone.
    pub fn new<S>(
        subscriptions: Arc<Subscriptions>,
        resolver: DayResolver,
        sink: S,
        run_at: NaiveTime,
    ) -> Scheduler
    where
        S: DestinationSink + 'static,
    {
        Scheduler {
            subscriptions,
            resolver,
            sink: Arc::new(sink),
            run_at,
            metrics: None,
        }
    }

    /// Records cycle outcomes in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Scheduler {
        self.metrics = Some(metrics);
        self
    }

    /// Sends the digests for the day after `today` to all channels.
    ///
    /// Failures are isolated per channel and never abort the cycle.
    pub async fn run_cycle(&self, today: NaiveDate) -> CycleReport {
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.cycle_duration_seconds().start_timer());

        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
        if matches!(tomorrow.weekday(), Weekday::Sat | Weekday::Sun) {
            log::info!("tomorrow ({tomorrow}) is on the weekend");
        }

        let channels = self.subscriptions.channels().await;
        log::info!(
            "sending digests for {} to {} channels",
            tomorrow,
            channels.len()
        );

        let mut report = CycleReport::default();

        for channel in channels {
            let status = match self.dispatch(channel, tomorrow).await {
                Ok(status) => status,
                Err(err) => {
                    log::error!("failed to send digest to channel {channel}: {err}");
                    DigestStatus::Error
                }
            };

            match status {
                DigestStatus::Sent => report.sent += 1,
                DigestStatus::Excluded => report.excluded += 1,
                DigestStatus::Error => report.failed += 1,
            }

            if let Some(metrics) = &self.metrics {
                metrics.digests_total(status).inc();
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .latest_cycle_timestamp_seconds()
                .set(Utc::now().timestamp());
        }
        if let Some(timer) = timer {
            timer.observe_duration();
        }

        report
    }

    async fn dispatch(&self, channel: ChannelId, day: NaiveDate) -> Result<DigestStatus> {
        let events = match self.resolver.resolve(channel, day).await {
            ResolvedDay::Excluded => return Ok(DigestStatus::Excluded),
            ResolvedDay::Events(events) => events,
        };

        if events.is_empty() {
            log::info!("nothing scheduled on {} for channel {}", day, channel);
        }

        self.sink.send(channel, &Digest::new(day, &events)).await?;

        Ok(DigestStatus::Sent)
    }

    /// Runs a cycle at every occurrence of `run_at` until a message is received via `stop`.
    async fn start(&self, mut stop: Receiver<()>) {
        let tz = self.resolver.timezone();

        loop {
            let now = Utc::now().with_timezone(&tz);
            let next_run = next_run_after(now, self.run_at);
            let wait = (next_run - now).to_std().unwrap_or_default();

            log::info!("waiting {:?} until {}", wait, next_run);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut stop => {
                    log::info!("stopping scheduler");
                    return;
                }
            }

            let today = Utc::now().with_timezone(&tz).date_naive();

            tokio::select! {
                report = self.run_cycle(today) => {
                    log::info!(
                        "digest cycle done: {} sent, {} excluded, {} failed",
                        report.sent,
                        report.excluded,
                        report.failed
                    );
                }
                _ = &mut stop => {
                    log::info!("stopping scheduler during digest cycle");
                    return;
                }
            }
        }
    }

    /// Starts the scheduler in a background task. Returns a `SchedulerHandle` to stop it.
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move {
            self.start(stop_rx).await;
        });

        SchedulerHandle {
            join_handle,
            stop_tx,
        }
    }
}

/// A handle for stopping a scheduler task.
pub struct SchedulerHandle {
    join_handle: JoinHandle<()>,
    stop_tx: Sender<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler, cancelling a pending wait or running cycle. Blocks until the
    /// background task is finished.
    pub async fn stop(self) -> io::Result<()> {
        if self.stop_tx.send(()).is_ok() {
            self.join_handle.await?;
        }

        Ok(())
    }
}
