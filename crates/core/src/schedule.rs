use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A recurring job owned by the component that started it.
///
/// The first tick fires one full `period` after `start`. Ticks never overlap:
/// a slow tick delays the next one. Dropping the task cancels it.
///
/// Started outside a Tokio runtime, the task is created already finished and
/// never ticks.
pub struct ScheduledTask {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn start<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let Ok(runtime) = Handle::try_current() else {
            warn!(
                event_name = "system.schedule.no_runtime",
                task = %name,
                "no tokio runtime; scheduled task not started"
            );
            cancel.cancel();
            return Self { name, cancel, handle: None };
        };

        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            debug!(event_name = "system.schedule.stopped", task = %task_name, "scheduled task stopped");
        });

        debug!(
            event_name = "system.schedule.started",
            task = %name,
            period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "scheduled task started"
        );

        Self { name, cancel, handle: Some(handle) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops future ticks. A tick already running completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
