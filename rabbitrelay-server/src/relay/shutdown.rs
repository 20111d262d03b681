use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::context::RelayContext;

/// Bound on stopping the consumer when the policy has no timeout of its own
pub const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How worker cancellation is fanned out at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ShutdownPolicy {
    /// Signal every worker and return immediately
    #[default]
    BestEffort,
    /// Signal every worker, then wait for each one up to the timeout and
    /// abort the ones that miss it
    AwaitCompletion {
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that were sent the cancellation signal
    pub cancelled: usize,
    /// Workers that confirmed completion in time
    pub completed: usize,
    /// Workers aborted after the timeout
    pub forced: usize,
    /// The consumer was aborted while blocked on a delivery
    pub consumer_aborted: bool,
}

/// Tears the relay down: consumer first, then every worker
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownCoordinator {
    policy: ShutdownPolicy,
}

impl ShutdownCoordinator {
    pub fn new(policy: ShutdownPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    fn consumer_stop_timeout(&self) -> Duration {
        match self.policy {
            ShutdownPolicy::BestEffort => CONSUMER_STOP_TIMEOUT,
            ShutdownPolicy::AwaitCompletion { timeout_ms } => Duration::from_millis(timeout_ms),
        }
    }

    pub async fn shutdown(&self, ctx: &mut RelayContext) -> ShutdownReport {
        info!("Shutting down relay");

        let mut report = ShutdownReport::default();

        // 1. No more deliveries; an in-flight one is finished by the consumer
        // unless it is stuck behind a full mailbox
        if let Some(consumer) = ctx.take_consumer() {
            report.consumer_aborted = !consumer.stop_within(self.consumer_stop_timeout()).await;
        }

        // 2.
        flush_diagnostics();

        // 3.
        for worker in ctx.workers_mut() {
            if worker.cancel() {
                report.cancelled += 1;
            }
        }

        if let ShutdownPolicy::AwaitCompletion { timeout_ms } = self.policy {
            let timeout = Duration::from_millis(timeout_ms);
            let completed = join_all(
                ctx.workers_mut()
                    .iter_mut()
                    .map(|worker| worker.wait_completed(timeout)),
            )
            .await;

            for (worker, done) in ctx.workers().iter().zip(completed) {
                if done {
                    report.completed += 1;
                } else {
                    warn!(
                        "Publisher {} did not finish within {:?}, aborting",
                        worker.name(),
                        timeout
                    );
                    worker.abort();
                    report.forced += 1;
                }
            }
        }

        info!(
            cancelled = report.cancelled,
            completed = report.completed,
            forced = report.forced,
            consumer_aborted = report.consumer_aborted,
            "Relay shut down"
        );
        report
    }
}

fn flush_diagnostics() {
    flush_stream("stdout", &mut std::io::stdout());
    flush_stream("stderr", &mut std::io::stderr());
}

fn flush_stream(name: &str, stream: &mut impl Write) -> bool {
    match stream.flush() {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to flush {}: {}", name, e);
            false
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                wait_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = wait_ctrl_c() => {}
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    wait_ctrl_c().await;
}

async fn wait_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Run the shutdown coordinator once `signal` resolves
///
/// The returned receiver yields the report when teardown is done.
pub fn spawn_termination_listener<F>(
    mut ctx: RelayContext,
    coordinator: ShutdownCoordinator,
    signal: F,
) -> oneshot::Receiver<ShutdownReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        signal.await;
        let report = coordinator.shutdown(&mut ctx).await;
        let _ = done_tx.send(report);
    });

    done_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tracing_test::traced_test;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    #[traced_test]
    fn test_flush_failure_is_logged() {
        assert!(!flush_stream("stderr", &mut BrokenPipe));
        assert!(logs_contain("Failed to flush stderr"));
    }

    #[test]
    fn test_flush_success() {
        assert!(flush_stream("stdout", &mut Vec::<u8>::new()));
    }

    #[test]
    fn test_consumer_stop_timeout_follows_policy() {
        assert_eq!(
            ShutdownCoordinator::default().consumer_stop_timeout(),
            CONSUMER_STOP_TIMEOUT
        );
        let coordinator =
            ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 250 });
        assert_eq!(
            coordinator.consumer_stop_timeout(),
            Duration::from_millis(250)
        );
    }
}
