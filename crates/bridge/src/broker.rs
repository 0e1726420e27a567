//! Long-lived MQTT session: connect, subscribe to telemetry, relay commands.
//!
//! The event loop runs in one background task. Inbound publishes are handed
//! to a separate dispatch task so a slow handler never stalls keep-alives or
//! PUBACK processing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, Transport,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

const REQUEST_QUEUE: usize = 20;
const DISPATCH_QUEUE: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
/// How long a stopping session lets the dispatcher finish queued messages.
const DISPATCH_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("mqtt client rejected the publish: {0}")]
    Client(#[from] ClientError),
    #[error("no broker acknowledgment within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before the broker acknowledged")]
    Aborted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("mqtt connection already started")]
    AlreadyStarted,
    #[error("mqtt connection was stopped")]
    Stopped,
}

/// Receives every message arriving on the telemetry subscription.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Outbound side of the session, as seen by the command relay.
pub trait CommandPublisher: Send + Sync + 'static {
    /// Publish at QoS 1 and resolve once the broker acknowledges delivery.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    fn is_connected(&self) -> bool;
}

/// Exponential reconnect delay: `min`, doubling, capped at `max`.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            next: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Matches broker PUBACKs to the publishers waiting on them.
///
/// rumqttc assigns packet ids inside the event loop, so a waiter is queued
/// before the request is handed over and only learns its id when the loop
/// reports the outgoing publish. Requests leave the client channel in order,
/// which keeps the queue aligned as long as enqueue and hand-over happen
/// under one lock.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn enqueue(&mut self, waiter: oneshot::Sender<()>) {
        self.queued.push_back(waiter);
    }

    /// Undo the most recent `enqueue` when the hand-over failed.
    fn dequeue_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) -> bool {
        match self.inflight.remove(&pkid) {
            Some(waiter) => {
                // The publisher may have timed out already.
                let _ = waiter.send(());
                true
            }
            None => false,
        }
    }

    /// Drop every waiter; each publisher sees its channel close.
    fn fail_all(&mut self) -> usize {
        let n = self.queued.len() + self.inflight.len();
        self.queued.clear();
        self.inflight.clear();
        n
    }
}

struct Inbound {
    topic: String,
    payload: Vec<u8>,
}

struct Inner {
    client: AsyncClient,
    host: String,
    port: u16,
    data_topic: String,
    publish_timeout: Duration,
    reconnect_min: Duration,
    reconnect_max: Duration,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    acks: Mutex<AckTracker>,
    publish_lock: tokio::sync::Mutex<()>,
    eventloop: tokio::sync::Mutex<Option<EventLoop>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "mqtt state change");
        }
    }

    /// Move to `to` only if still in `from`, so a concurrent `stop` wins.
    fn transition_from(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(from = ?from, to = ?to, "mqtt state change");
        }
        moved
    }

    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_lost(&self) {
        self.transition(ConnectionState::Connecting);
        let failed = self.acks().fail_all();
        if failed > 0 {
            warn!(pending = failed, "pending publishes aborted by disconnect");
        }
    }
}

/// Handle to the broker session. Clones share the same connection.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Build the client. Nothing touches the network until [`Broker::start`].
    pub fn new(cfg: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        opts.set_clean_session(true);
        if let Some((user, pass)) = cfg.credentials() {
            opts.set_credentials(user, pass);
        }
        if cfg.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_QUEUE);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                client,
                host: cfg.host.clone(),
                port: cfg.port,
                data_topic: cfg.data_topic.clone(),
                publish_timeout: Duration::from_secs(cfg.publish_timeout_secs),
                reconnect_min: Duration::from_secs(cfg.reconnect_min_secs),
                reconnect_max: Duration::from_secs(cfg.reconnect_max_secs),
                state,
                cancel: CancellationToken::new(),
                acks: Mutex::new(AckTracker::default()),
                publish_lock: tokio::sync::Mutex::new(()),
                eventloop: tokio::sync::Mutex::new(Some(eventloop)),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Spawn the session task and return immediately.
    ///
    /// Connection progress is reported through [`Broker::state`]; failures
    /// are retried with backoff until [`Broker::stop`].
    pub async fn start<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), StartError> {
        if self.inner.cancel.is_cancelled() {
            return Err(StartError::Stopped);
        }
        let mut task = self.inner.task.lock().await;
        let Some(eventloop) = self.inner.eventloop.lock().await.take() else {
            return Err(StartError::AlreadyStarted);
        };

        info!(
            host = %self.inner.host,
            port = self.inner.port,
            topic = %self.inner.data_topic,
            "connecting to mqtt broker"
        );
        self.inner.transition(ConnectionState::Connecting);
        *task = Some(tokio::spawn(run(
            Arc::clone(&self.inner),
            eventloop,
            handler,
        )));
        Ok(())
    }

    /// Publish `payload` at QoS 1 and wait for the broker's PUBACK.
    ///
    /// Fails fast when not connected. The whole call is bounded by the
    /// configured publish timeout.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        let limit = self.inner.publish_timeout;
        let deadline = Instant::now() + limit;

        let serial = timeout_at(deadline, self.inner.publish_lock.lock())
            .await
            .map_err(|_| PublishError::Timeout(limit))?;

        let (tx, rx) = oneshot::channel();
        self.inner.acks().enqueue(tx);
        let handed_over = timeout_at(
            deadline,
            self.inner
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await;
        match handed_over {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.inner.acks().dequeue_last();
                return Err(PublishError::Client(e));
            }
            Err(_) => {
                self.inner.acks().dequeue_last();
                return Err(PublishError::Timeout(limit));
            }
        }
        drop(serial);

        match timeout_at(deadline, rx).await {
            Ok(Ok(())) => {
                debug!(topic, "publish acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(PublishError::Aborted),
            Err(_) => Err(PublishError::Timeout(limit)),
        }
    }

    /// Unsubscribe, disconnect and wait for the session task to finish.
    ///
    /// Idempotent. Any publish still waiting for an acknowledgment fails
    /// with [`PublishError::Aborted`].
    pub async fn stop(&self) {
        let task = self.inner.task.lock().await.take();
        let Some(mut task) = task else {
            self.inner.acks().fail_all();
            self.inner.cancel.cancel();
            self.inner.transition(ConnectionState::Disconnected);
            return;
        };

        let was_connected = self.state() == ConnectionState::Connected;
        self.inner.transition(ConnectionState::Disconnecting);
        self.inner.acks().fail_all();

        if was_connected {
            if let Err(e) = self.inner.client.try_unsubscribe(&self.inner.data_topic) {
                debug!(error = %e, "unsubscribe not queued");
            }
            if let Err(e) = self.inner.client.try_disconnect() {
                debug!(error = %e, "disconnect not queued");
            }
        } else {
            self.inner.cancel.cancel();
        }

        if timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            warn!("mqtt disconnect not confirmed in time, closing connection");
            self.inner.cancel.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "mqtt session task failed");
            }
        }
        self.inner.cancel.cancel();
        self.inner.transition(ConnectionState::Disconnected);
        info!("mqtt connection closed");
    }

    #[cfg(test)]
    fn force_state(&self, state: ConnectionState) {
        self.inner.transition(state);
    }
}

impl CommandPublisher for Broker {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        Broker::publish(self, topic, payload)
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

async fn run<H: MessageHandler>(inner: Arc<Inner>, mut eventloop: EventLoop, handler: Arc<H>) {
    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE);
    let mut dispatcher = tokio::spawn(dispatch(rx, handler));
    let mut backoff = Backoff::new(inner.reconnect_min, inner.reconnect_max);

    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if inner.state() == ConnectionState::Disconnecting {
                    continue;
                }
                backoff.reset();
                inner.transition(ConnectionState::Connected);
                info!(session_present = ack.session_present, "mqtt connected");
                if let Err(e) = inner
                    .client
                    .try_subscribe(&inner.data_topic, QoS::AtLeastOnce)
                {
                    error!(topic = %inner.data_topic, error = %e, "mqtt subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(codes = ?ack.return_codes, "subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Inbound {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                };
                let sent = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    sent = tx.send(msg) => sent,
                };
                if sent.is_err() {
                    error!("dispatcher gone, inbound message dropped");
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => inner.acks().sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if !inner.acks().acked(ack.pkid) {
                    debug!(pkid = ack.pkid, "puback with no waiter");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker closed the session");
                inner.connection_lost();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if inner.state() == ConnectionState::Disconnecting {
                    break;
                }
                let was_connected = inner.state() == ConnectionState::Connected;
                inner.connection_lost();
                let delay = backoff.next_delay();
                match &e {
                    ConnectionError::ConnectionRefused(
                        code @ (ConnectReturnCode::BadUserNamePassword
                        | ConnectReturnCode::NotAuthorized),
                    ) => {
                        // Not "connecting" while waiting out a refusal.
                        inner.transition_from(
                            ConnectionState::Connecting,
                            ConnectionState::Disconnected,
                        );
                        error!(
                            ?code,
                            retry_in_secs = delay.as_secs(),
                            "mqtt broker rejected credentials"
                        );
                    }
                    _ if was_connected => warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "mqtt connection lost"
                    ),
                    _ => warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "mqtt connect failed"
                    ),
                }
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                inner.transition_from(ConnectionState::Disconnected, ConnectionState::Connecting);
            }
        }
    }

    drop(tx);
    match timeout(DISPATCH_DRAIN, &mut dispatcher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "dispatcher task failed"),
        Err(_) => {
            dispatcher.abort();
            warn!("dispatcher still busy at shutdown, queued messages dropped");
        }
    }
    inner.acks().fail_all();
    inner.transition(ConnectionState::Disconnected);
    info!("mqtt session ended");
}

/// Feed inbound messages to `handler` in arrival order.
///
/// Each call runs in its own task so a panicking handler costs one message,
/// not the subscription.
async fn dispatch<H: MessageHandler>(mut rx: mpsc::Receiver<Inbound>, handler: Arc<H>) {
    while let Some(msg) = rx.recv().await {
        let topic = msg.topic.clone();
        let handler = Arc::clone(&handler);
        let outcome =
            tokio::spawn(async move { handler.handle(&msg.topic, &msg.payload).await }).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%topic, error = %e, "inbound message dropped"),
            Err(e) => error!(%topic, error = %e, "message handler panicked"),
        }
    }
}
