//! Restarting wrapper around the source stage
//!
//! A failed stage is replaced by a fresh one, with a fresh client, after the
//! backoff of the [`RetryPolicy`]. Consumption resumes from the committed
//! offsets, so records buffered but not committed by the failed stage are
//! delivered again.

use crate::consumer::client::{ClientFactory, ConsumerClient};
use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::SourceResult;
use crate::consumer::message::CommittableMessage;
use crate::consumer::retry::RetryPolicy;
use crate::consumer::shutdown::ShutdownHandle;
use crate::consumer::stage::{SourceHandle, SourceStage};
use crate::consumer::subscription::Subscription;
use futures::Stream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type KeyOf<F> = <<F as ClientFactory>::Client as ConsumerClient>::Key;
type ValueOf<F> = <<F as ClientFactory>::Client as ConsumerClient>::Value;
type Pulled<F> = Option<SourceResult<CommittableMessage<KeyOf<F>, ValueOf<F>>>>;

/// Source that restarts its stage after failures
pub struct RestartingSource<F: ClientFactory + Sync> {
    settings: ConsumerSettings,
    subscription: Subscription,
    factory: Arc<F>,
    policy: RetryPolicy,
    shutdown: ShutdownHandle,
    current: Option<(SourceHandle<KeyOf<F>, ValueOf<F>>, JoinHandle<()>)>,
    attempt: u32,
    restarts: u32,
    finished: bool,
}

impl<F: ClientFactory + Sync> RestartingSource<F> {
    /// Create a restarting source; no stage runs until the first pull
    pub fn new(
        settings: ConsumerSettings,
        subscription: Subscription,
        factory: F,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            settings,
            subscription,
            factory: Arc::new(factory),
            policy,
            shutdown: ShutdownHandle::new(),
            current: None,
            attempt: 0,
            restarts: 0,
            finished: false,
        }
    }

    /// Use an externally owned shutdown handle
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that stops the current stage and prevents restarts
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Number of times a stage was restarted
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Pull the next record
    ///
    /// Failures are absorbed while the policy allows another restart. Once it
    /// does not, the last failure is returned and the source ends.
    pub async fn pull(&mut self) -> Pulled<F> {
        loop {
            if self.finished {
                return None;
            }
            if self.current.is_none() {
                if self.shutdown.is_shutdown_requested() {
                    self.finished = true;
                    return None;
                }
                self.current = Some(self.start());
            }
            let (handle, _) = self.current.as_mut()?;

            match handle.pull().await {
                Some(Ok(message)) => {
                    self.attempt = 0;
                    return Some(Ok(message));
                }
                None => {
                    debug!("Source stage completed");
                    self.stop_current().await;
                    self.finished = true;
                    return None;
                }
                Some(Err(err)) => {
                    self.stop_current().await;
                    self.attempt += 1;

                    if !self.policy.should_retry(self.attempt) {
                        error!(attempts = self.attempt, "Giving up on source: {}", err);
                        self.finished = true;
                        return Some(Err(err));
                    }

                    let backoff = self.policy.next_backoff(self.attempt);
                    warn!(
                        attempt = self.attempt,
                        ?backoff,
                        "Source failed, restarting: {}",
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.requested() => {
                            info!("Shutdown requested during restart backoff");
                            self.finished = true;
                            return None;
                        }
                    }
                    self.restarts += 1;
                }
            }
        }
    }

    fn start(&self) -> (SourceHandle<KeyOf<F>, ValueOf<F>>, JoinHandle<()>) {
        debug!(restarts = self.restarts, "Starting source stage");
        SourceStage::new(
            self.settings.clone(),
            self.subscription.clone(),
            self.factory.clone(),
        )
        .with_shutdown(self.shutdown.clone())
        .spawn()
    }

    async fn stop_current(&mut self) {
        if let Some((handle, join)) = self.current.take() {
            drop(handle);
            if let Err(e) = join.await {
                error!("Source stage task failed: {}", e);
            }
        }
    }

    /// Pull records as a stream
    pub fn into_stream(self) -> impl Stream<Item = SourceResult<CommittableMessage<KeyOf<F>, ValueOf<F>>>> {
        futures::stream::unfold(self, |mut source| async move {
            source.pull().await.map(|item| (item, source))
        })
    }
}
