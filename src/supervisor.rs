use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// A periodically-repeating ingestion task. Implementations are internally
/// sequential; the supervisor provides the loop, the cadence and the
/// cancellation point.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Delay between the end of one cycle and the start of the next.
    fn poll_interval(&self) -> Duration;

    /// Perform one ingestion cycle. Errors are logged by the supervisor and
    /// never terminate the collector; the next tick is another chance.
    async fn run_cycle(&self) -> Result<()>;
}

/// Owns the collector tasks and the shutdown signal. Dropping an in-flight
/// cycle at a suspension point is the cancellation mechanism; cursors are
/// only ever written between pages, so no partial progress is persisted.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// A receiver observing the shutdown signal, for collaborators such as
    /// the health server.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Launch a collector as an independent recurring task.
    pub fn spawn(&mut self, collector: Arc<dyn Collector>) {
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            info!(collector = collector.name(), "collector started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    result = collector.run_cycle() => match result {
                        Ok(()) => debug!(collector = collector.name(), "cycle complete"),
                        Err(err) => {
                            error!(collector = collector.name(), error = %err, "cycle failed");
                        }
                    },
                }

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(collector.poll_interval()) => {}
                }
            }
            info!(collector = collector.name(), "collector stopped");
        });

        self.handles.push(handle);
    }

    /// Signal shutdown and wait for every collector to return, aborting any
    /// that outlive the grace window.
    pub async fn join(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let joined = futures::future::join_all(self.handles.drain(..));

        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!("collectors did not stop within the grace window, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCollector {
        cycles: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Collector for CountingCollector {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_cycle(&self) -> Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingCollector {
        cycles: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Collector for FailingCollector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_cycle(&self) -> Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::IngestError::Parse("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn collector_runs_repeatedly_until_shutdown() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Arc::new(CountingCollector {
            cycles: cycles.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.join(Duration::from_secs(1)).await;

        assert!(cycles.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cycle_failure_does_not_terminate_collector() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Arc::new(FailingCollector {
            cycles: cycles.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.join(Duration::from_secs(1)).await;

        // Failing cycles keep being retried on the next tick.
        assert!(cycles.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn join_returns_promptly_when_idle() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Arc::new(CountingCollector {
            cycles: Arc::new(AtomicUsize::new(0)),
        }));

        let started = std::time::Instant::now();
        supervisor.join(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
