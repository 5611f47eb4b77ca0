use async_trait::async_trait;
use flume::{Receiver, Sender};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Something the [`Reaper`] can sweep.
#[async_trait]
pub trait Evict: Send + Sync + 'static {
    type Error: Display + Send + 'static;

    /// Drop every expired idle connection, returning how many went away.
    async fn drop_expired(&self) -> Result<usize, Self::Error>;
}

/// Background task calling [`Evict::drop_expired`] every `interval`.
///
/// The reaper only keeps a weak reference to its target and ends once the
/// target is gone, [`stop`](Reaper::stop) is called or the reaper is dropped.
/// A failed or panicking pass is logged and the loop keeps going.
pub struct Reaper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl Reaper {
    /// Start reaping on the current tokio runtime.
    pub fn spawn<T: Evict>(target: Weak<T>, interval: Duration) -> Self {
        let (stop, stopped) = flume::bounded(1);
        let handle = tokio::spawn(run(target, interval, stopped));
        Self {
            stop,
            handle,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ask the loop to end. The pass in flight, if any, completes first.
    pub fn stop(&self) {
        _ = self.stop.try_send(());
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Debug for Reaper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("interval", &self.interval)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn run<T: Evict>(target: Weak<T>, interval: Duration, stopped: Receiver<()>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            // a stop signal or a dropped sender
            _ = stopped.recv_async() => break,
        }
        let Some(target) = target.upgrade() else {
            break;
        };
        // own task so a panic in one pass can't take the loop down
        let pass = tokio::spawn(async move { target.drop_expired().await });
        match pass.await {
            Ok(Ok(0)) => {}
            Ok(Ok(dropped)) => tracing::debug!(dropped, "reaped expired connections"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "an error occurred while dropping expired connections")
            }
            Err(e) => tracing::error!(error = %e, "reaper pass aborted"),
        }
    }
    tracing::debug!("connection reaper stopped");
}
