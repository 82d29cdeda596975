//! The buffered pull stage
//!
//! [`SourceLogic`] holds all mutable state of the source: the record buffer,
//! the paused flag, the assigned partitions and the open downstream demand.
//! It is only ever touched by one task, the driver spawned by
//! [`SourceStage::spawn`], which multiplexes the poll timer and pull requests
//! coming from [`SourceHandle`]. Client notifications are returned by `poll`
//! and handled in delivery order on that same task.

use crate::consumer::backpressure::{BackpressureController, FlowAction};
use crate::consumer::client::{ClientEvent, ClientFactory, ConsumerClient};
use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{ErrorClass, SourceError, SourceResult};
use crate::consumer::message::{
    CommittableMessage, CommittableOffset, Committer, Message, PartitionOffset, TopicPartition,
};
use crate::consumer::shutdown::ShutdownHandle;
use crate::consumer::subscription::{client_pattern, Subscription};
use crate::consumer::supervision::Directive;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Observable state of the stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// No pending demand; the buffer may hold records
    Idle,
    /// Downstream pulled while the buffer was empty
    AwaitingDemand,
    /// Buffer over capacity, client told to stop delivering
    Paused,
    /// Shutdown observed, serving what is already buffered
    Draining,
    /// Terminal
    Stopped,
}

#[derive(Debug)]
enum Termination {
    Completed,
    Failed(Option<SourceError>),
}

type Buffered<C> =
    CommittableMessage<<C as ConsumerClient>::Key, <C as ConsumerClient>::Value>;

/// State machine of the buffered source
pub struct SourceLogic<C: ConsumerClient> {
    settings: ConsumerSettings,
    subscription: Subscription,
    shutdown: ShutdownHandle,
    client: Option<C>,
    client_name: String,
    committer: Option<Arc<dyn Committer>>,
    buffer: VecDeque<Buffered<C>>,
    assigned: Vec<TopicPartition>,
    backpressure: BackpressureController,
    demand: bool,
    outlet: Option<Buffered<C>>,
    draining: bool,
    termination: Option<Termination>,
}

impl<C: ConsumerClient> SourceLogic<C> {
    /// Create the logic; the client is created by [`SourceLogic::pre_start`]
    pub fn new(
        settings: ConsumerSettings,
        subscription: Subscription,
        shutdown: ShutdownHandle,
    ) -> Self {
        let backpressure = BackpressureController::new(settings.buffer_size);
        let capacity = backpressure.capacity();
        Self {
            settings,
            subscription,
            shutdown,
            client: None,
            client_name: String::new(),
            committer: None,
            buffer: VecDeque::with_capacity(capacity + 1),
            assigned: Vec::new(),
            backpressure,
            demand: false,
            outlet: None,
            draining: false,
            termination: None,
        }
    }

    /// Create the client and subscribe or assign
    pub fn pre_start<F>(&mut self, factory: &F) -> SourceResult<()>
    where
        F: ClientFactory<Client = C>,
    {
        self.settings.validate()?;
        self.subscription.validate()?;

        let client = factory.create(&self.settings)?;
        self.client_name = client.name().to_string();
        self.committer = Some(client.committer());
        info!(client = %self.client_name, "Consumer started");

        let client = self.client.insert(client);
        match &self.subscription {
            Subscription::Topics(topics) => {
                client.subscribe(topics)?;
                info!("Subscribed to topics: {:?}", topics);
            }
            Subscription::TopicPattern(pattern) => {
                client.subscribe_pattern(&client_pattern(pattern))?;
                info!("Subscribed to topic pattern: {}", pattern);
            }
            Subscription::Assignment(partitions) => {
                client.assign(partitions)?;
                info!("Assigned partitions: {:?}", partitions);
            }
            Subscription::AssignmentWithOffset(partitions) => {
                client.assign_with_offsets(partitions)?;
                info!("Assigned partitions with offsets: {:?}", partitions);
            }
        }
        self.assigned = self.subscription.initial_partitions();
        Ok(())
    }

    /// Downstream signalled demand for one record
    pub async fn on_pull(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.demand = true;

        if !self.buffer.is_empty() {
            self.dispatch();
            return;
        }
        if self.draining {
            self.complete();
            return;
        }
        if self.backpressure.is_paused() {
            let action = self.backpressure.on_dequeue(0);
            self.apply_flow(action);
        }
        self.poll_cycle().await;
    }

    /// Scheduled poll timer fired
    pub async fn on_timer(&mut self) {
        if self.is_stopped() {
            return;
        }
        if self.demand && !self.buffer.is_empty() {
            self.dispatch();
            return;
        }
        if self.draining {
            return;
        }
        self.poll_cycle().await;
    }

    async fn poll_cycle(&mut self) {
        if self.is_stopped() || self.draining {
            return;
        }
        if self.shutdown.is_shutdown_requested() {
            self.on_shutdown();
            return;
        }

        let timeout = self.settings.poll_timeout;
        let events = match self.client.as_mut() {
            Some(client) => client.poll(timeout).await,
            None => return,
        };

        for event in events {
            if self.is_stopped() {
                debug!("Stage stopped, discarding remaining client events");
                break;
            }
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: ClientEvent<C::Key, C::Value>) {
        match event {
            ClientEvent::Message(message) => self.on_message(message),
            ClientEvent::ConsumeError {
                topic,
                partition,
                offset,
                reason,
            } => {
                error!(%topic, partition, offset, "Consume error: {}", reason);
                let err = SourceError::Deserialization {
                    topic,
                    partition,
                    offset,
                    reason,
                };
                match self.settings.supervision.decide(&err) {
                    Directive::Stop => self.fail(err),
                    directive => debug!(?directive, "Ignoring consume error"),
                }
            }
            ClientEvent::Error(broker) => {
                match broker.class {
                    ErrorClass::Retriable => warn!("{}", broker),
                    _ => error!("{}", broker),
                }
                let err = SourceError::Broker(broker);
                self.supervise(err);
            }
            ClientEvent::PartitionsAssigned(partitions) => self.on_partitions_assigned(partitions),
            ClientEvent::PartitionsRevoked(partitions) => self.on_partitions_revoked(partitions),
        }
    }

    fn on_message(&mut self, record: Message<C::Key, C::Value>) {
        let Some(committer) = self.committer.clone() else {
            warn!("Record received before the client was started");
            return;
        };
        let committable_offset = CommittableOffset::new(
            PartitionOffset {
                group_id: self.settings.group_id.clone(),
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            },
            committer,
        );
        self.buffer.push_back(CommittableMessage {
            record,
            committable_offset,
        });

        let action = self.backpressure.on_enqueue(self.buffer.len());
        self.apply_flow(action);

        if self.demand {
            self.dispatch();
        }
    }

    fn on_partitions_assigned(&mut self, partitions: Vec<TopicPartition>) {
        info!(client = %self.client_name, "Partitions were assigned: {:?}", partitions);
        let result = match self.client.as_mut() {
            Some(client) => client.assign(&partitions),
            None => Ok(()),
        };
        self.assigned = partitions;
        if let Err(e) = result {
            self.supervise(e);
            return;
        }
        let action = self.backpressure.on_reassign();
        self.apply_flow(action);
    }

    fn on_partitions_revoked(&mut self, partitions: Vec<TopicPartition>) {
        info!(
            client = %self.client_name,
            buffered = self.buffer.len(),
            "Partitions were revoked: {:?}",
            partitions
        );
        let result = match self.client.as_mut() {
            Some(client) => client.unassign(),
            None => Ok(()),
        };
        self.assigned.clear();
        if let Err(e) = result {
            self.supervise(e);
        }
    }

    fn on_shutdown(&mut self) {
        if self.settings.drain_on_shutdown && !self.buffer.is_empty() {
            info!(buffered = self.buffer.len(), "Shutdown requested, draining buffer");
            self.draining = true;
            if self.demand {
                self.dispatch();
            }
        } else {
            info!("Shutdown requested, completing stage");
            self.complete();
        }
    }

    fn dispatch(&mut self) {
        let Some(element) = self.buffer.pop_front() else {
            return;
        };
        self.outlet = Some(element);
        self.demand = false;

        let action = self.backpressure.on_dequeue(self.buffer.len());
        self.apply_flow(action);

        if self.draining && self.buffer.is_empty() {
            self.complete();
        }
    }

    fn apply_flow(&mut self, action: FlowAction) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let result = match action {
            FlowAction::None => return,
            FlowAction::Pause => client.pause(&self.assigned),
            FlowAction::Resume => client.resume(&self.assigned),
        };
        if let Err(e) = result {
            warn!(?action, "Client rejected flow control: {}", e);
            self.backpressure.rollback(action);
            self.supervise(e);
        }
    }

    fn supervise(&mut self, err: SourceError) {
        match self.settings.supervision.decide_broker(&err) {
            Directive::Stop => self.fail(err),
            Directive::Resume => debug!("Resuming after error: {}", err),
            Directive::Retry => debug!("Retrying after error: {}", err),
        }
    }

    /// Complete the stage successfully
    pub fn complete(&mut self) {
        if self.termination.is_some() {
            return;
        }
        if !self.buffer.is_empty() {
            debug!(
                buffered = self.buffer.len(),
                "Completing with uncommitted buffered records"
            );
        }
        self.termination = Some(Termination::Completed);
    }

    /// Fail the stage; later client events are ignored
    pub fn fail(&mut self, err: SourceError) {
        if self.termination.is_some() {
            return;
        }
        error!(client = %self.client_name, "Source stage failed: {}", err);
        self.termination = Some(Termination::Failed(Some(err)));
    }

    /// Close the client; safe to call more than once
    pub fn post_stop(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close();
            info!(
                client = %self.client_name,
                pauses = self.backpressure.pause_count(),
                resumes = self.backpressure.resume_count(),
                "Consumer stopped"
            );
        }
    }

    /// Take the record pushed to downstream, if any
    pub fn take_element(&mut self) -> Option<Buffered<C>> {
        self.outlet.take()
    }

    /// Put back a record downstream did not receive
    pub fn return_element(&mut self, element: Buffered<C>) {
        self.buffer.push_front(element);
    }

    /// Take the failure of a failed stage; returns it only once
    pub fn take_failure(&mut self) -> Option<SourceError> {
        match &mut self.termination {
            Some(Termination::Failed(err)) => err.take(),
            _ => None,
        }
    }

    /// Current state
    pub fn state(&self) -> StageState {
        if self.is_stopped() {
            StageState::Stopped
        } else if self.draining {
            StageState::Draining
        } else if self.backpressure.is_paused() {
            StageState::Paused
        } else if self.demand && self.buffer.is_empty() {
            StageState::AwaitingDemand
        } else {
            StageState::Idle
        }
    }

    /// Whether the stage reached its terminal state
    pub fn is_stopped(&self) -> bool {
        self.termination.is_some()
    }

    /// Whether downstream has open demand
    pub fn has_demand(&self) -> bool {
        self.demand
    }

    /// Whether the client is paused
    pub fn is_paused(&self) -> bool {
        self.backpressure.is_paused()
    }

    /// Number of buffered records
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Partitions currently assigned to the client
    pub fn assigned_partitions(&self) -> &[TopicPartition] {
        &self.assigned
    }
}

impl<C: ConsumerClient> Drop for SourceLogic<C> {
    fn drop(&mut self) {
        self.post_stop();
    }
}

type PullReply<K, V> = oneshot::Sender<Option<SourceResult<CommittableMessage<K, V>>>>;

/// A source stage ready to be started
pub struct SourceStage<F: ClientFactory> {
    settings: ConsumerSettings,
    subscription: Subscription,
    factory: F,
    shutdown: ShutdownHandle,
}

type KeyOf<F> = <<F as ClientFactory>::Client as ConsumerClient>::Key;
type ValueOf<F> = <<F as ClientFactory>::Client as ConsumerClient>::Value;

impl<F: ClientFactory> SourceStage<F> {
    /// Create a stage
    pub fn new(settings: ConsumerSettings, subscription: Subscription, factory: F) -> Self {
        Self {
            settings,
            subscription,
            factory,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Use an externally owned shutdown handle
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that stops this stage
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Start the driver task
    pub fn spawn(self) -> (SourceHandle<KeyOf<F>, ValueOf<F>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = SourceHandle {
            mailbox: tx,
            shutdown: self.shutdown.clone(),
        };
        let join = tokio::spawn(self.run(rx));
        (handle, join)
    }

    async fn run(self, mut mailbox: mpsc::Receiver<PullReply<KeyOf<F>, ValueOf<F>>>) {
        let SourceStage {
            settings,
            subscription,
            factory,
            shutdown,
        } = self;
        let poll_interval = settings.poll_interval;
        let mut logic: SourceLogic<F::Client> = SourceLogic::new(settings, subscription, shutdown);

        if let Err(e) = logic.pre_start(&factory) {
            logic.fail(e);
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Option<PullReply<KeyOf<F>, ValueOf<F>>> = None;

        while !logic.is_stopped() {
            tokio::select! {
                request = mailbox.recv() => match request {
                    Some(reply) => {
                        pending = Some(reply);
                        logic.on_pull().await;
                    }
                    None => {
                        debug!("Downstream cancelled, completing stage");
                        logic.complete();
                    }
                },
                _ = ticker.tick() => logic.on_timer().await,
            }
            Self::deliver(&mut logic, &mut pending);
        }

        logic.post_stop();

        match pending.take() {
            Some(reply) => {
                let _ = reply.send(logic.take_failure().map(Err));
            }
            None => {
                if let Some(err) = logic.take_failure() {
                    if let Some(reply) = mailbox.recv().await {
                        let _ = reply.send(Some(Err(err)));
                    }
                }
            }
        }
        debug!("Source stage driver finished");
    }

    fn deliver(
        logic: &mut SourceLogic<F::Client>,
        pending: &mut Option<PullReply<KeyOf<F>, ValueOf<F>>>,
    ) {
        let Some(element) = logic.take_element() else {
            return;
        };
        match pending.take() {
            Some(reply) => {
                if let Err(Some(Ok(element))) = reply.send(Some(Ok(element))) {
                    debug!("Pull was abandoned, returning record to the buffer");
                    logic.return_element(element);
                }
            }
            None => logic.return_element(element),
        }
    }
}

/// Downstream side of a running stage
pub struct SourceHandle<K, V> {
    mailbox: mpsc::Sender<PullReply<K, V>>,
    shutdown: ShutdownHandle,
}

impl<K: Send + 'static, V: Send + 'static> SourceHandle<K, V> {
    /// Signal demand for one record
    ///
    /// Returns `None` once the stage completed, and the failure once if it
    /// failed.
    pub async fn pull(&mut self) -> Option<SourceResult<CommittableMessage<K, V>>> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(tx).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Request the stage to stop
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Shutdown handle of the stage
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Pull records as a stream
    pub fn into_stream(self) -> impl Stream<Item = SourceResult<CommittableMessage<K, V>>> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.pull().await.map(|item| (item, handle))
        })
    }
}

/// Start a committable source
pub fn committable_source<F: ClientFactory>(
    settings: ConsumerSettings,
    subscription: Subscription,
    factory: F,
) -> (SourceHandle<KeyOf<F>, ValueOf<F>>, JoinHandle<()>) {
    SourceStage::new(settings, subscription, factory).spawn()
}
