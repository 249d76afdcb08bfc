//! Per-region polling loop.

use std::sync::Arc;
use std::time::Duration;

use depot_core::UpdaterConfig;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::{DiscoveredVersion, RegionUpdater};

/// Wait before the first check, then between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterSchedule {
    pub delay: Duration,
    pub interval: Duration,
}

impl UpdaterSchedule {
    /// An `interval` of 0 means the default interval.
    pub fn from_config(config: &UpdaterConfig) -> Self {
        let interval = match config.interval {
            0 => UpdaterConfig::default().interval,
            mins => mins,
        };
        Self {
            delay: Duration::from_secs(config.delay * 60),
            interval: Duration::from_secs(interval * 60),
        }
    }
}

/// Poll `updater` until shutdown, forwarding everything it finds.
///
/// A failed check is logged and the next one runs after the normal
/// interval. The loop also ends when the receiving side is gone.
pub async fn run_updater(
    updater: Arc<dyn RegionUpdater>,
    schedule: UpdaterSchedule,
    events: mpsc::Sender<DiscoveredVersion>,
    mut shutdown: watch::Receiver<bool>,
) {
    let prefix = updater.prefix().to_string();
    info!(%prefix, mins = schedule.delay.as_secs() / 60, "waiting to check for updates");
    let mut wait = schedule.delay;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                info!(%prefix, "updater stopped");
                return;
            }
        }

        match updater.check().await {
            Ok(found) => {
                for version in found {
                    if events.send(version).await.is_err() {
                        info!(%prefix, "intake closed, updater stopped");
                        return;
                    }
                }
            }
            Err(e) => error!(%prefix, error = %e, "could not update"),
        }

        info!(%prefix, mins = schedule.interval.as_secs() / 60, "check complete, rescheduled");
        wait = schedule.interval;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{UpdaterError, UpdaterResult};

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegionUpdater for Flaky {
        fn prefix(&self) -> &str {
            "nz-wlg"
        }

        async fn check(&self) -> UpdaterResult<Vec<DiscoveredVersion>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(UpdaterError::Archive("truncated".into()));
            }
            Ok(vec![DiscoveredVersion {
                prefix: "nz-wlg".into(),
                version: format!("v{n}"),
                auto_promote: false,
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let updater = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let schedule = UpdaterSchedule {
            delay: Duration::from_secs(60),
            interval: Duration::from_secs(600),
        };
        let task = tokio::spawn(run_updater(updater.clone(), schedule, tx, stop_rx));

        assert_eq!(rx.recv().await.unwrap().version, "v1");
        assert_eq!(rx.recv().await.unwrap().version, "v2");
        assert_eq!(updater.calls.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn schedule_is_in_minutes() {
        let schedule = UpdaterSchedule::from_config(&UpdaterConfig::default());
        assert_eq!(schedule.delay, Duration::from_secs(300));
        assert_eq!(schedule.interval, Duration::from_secs(86_400));
    }

    #[test]
    fn zero_interval_uses_default() {
        let config = UpdaterConfig {
            delay: 0,
            interval: 0,
            ..UpdaterConfig::default()
        };
        let schedule = UpdaterSchedule::from_config(&config);
        assert_eq!(schedule.delay, Duration::ZERO);
        assert_eq!(schedule.interval, Duration::from_secs(86_400));
    }
}
