//! Long-running periodic tasks with an explicit stop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Owner of a periodic task. Dropping the handle also stops the loop.
#[derive(Debug)]
pub struct BackgroundHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BackgroundHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop and wait for it to exit. A pass in progress is allowed to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("{} task ended abnormally: {}", self.name, e);
        }
    }
}

/// Run `pass` immediately and then every `period` until stopped.
///
/// Passes never overlap; a slow pass delays the next tick instead of queueing a burst.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> BackgroundHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        info!("{} started (every {:?})", name, period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    debug!("{} pass starting", name);
                    pass().await;
                }
            }
        }

        info!("{} stopped", name);
    });

    BackgroundHandle {
        name,
        shutdown: Some(shutdown_tx),
        task,
    }
}
