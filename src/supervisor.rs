//! Per-broker connection supervisor.
//!
//! Every registered broker gets one [`Supervisor`] running as its own task. The task owns
//! the broker's link, connection state, reconnect timer and subscription tracker, and
//! handles commands, link events, timer ticks and internal completions one at a time.

use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DatabaseService;
use crate::forwarder::{InboundMessage, MessageForwarder};
use crate::link::{
    status_topic, Connector, LinkError, LinkEvent, LinkEvents, LinkHandle, LinkOptions,
    TransportMode, INSECURE_PORT, SECURE_PORT, STATUS_OFFLINE, STATUS_ONLINE,
};
use crate::models::BrokerEndpoint;
use crate::pem::normalize_ca_cert;
use crate::subscriptions::SubscriptionTracker;

const COMMAND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Timing and retry tunables of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub reconnect_delay: Duration,
    pub fallback_delay: Duration,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub store_retry_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(10),
            fallback_delay: Duration::from_secs(2),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            store_retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of one supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub broker_id: String,
    pub host: String,
    pub port: u16,
    pub state: ConnectionState,
    pub is_connected: bool,
    pub subscribed_topics: Vec<String>,
    pub reconnect_attempts: u32,
    pub reconnect_timer_active: bool,
    pub using_plaintext_fallback: bool,
    pub client_id: String,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Subscribe { topic: String, reply: oneshot::Sender<bool> },
    Unsubscribe { topic: String, reply: oneshot::Sender<bool> },
    Reconcile,
}

/// Completions of work the supervisor pushed off its own task.
#[derive(Debug)]
enum Internal {
    SubscribeSettled { generation: u64, topic: String, acked: bool },
    UnsubscribeSettled { generation: u64, topic: String, acked: bool },
    ActiveTopics { generation: u64, topics: Vec<String> },
}

/// Shared services a supervisor works with.
#[derive(Clone)]
pub struct SupervisorContext {
    pub connector: Arc<dyn Connector>,
    pub db: Arc<DatabaseService>,
    pub forwarder: Arc<MessageForwarder>,
    pub settings: SupervisorSettings,
}

/// Registry-side handle to a running supervisor.
pub struct SupervisorHandle {
    broker_id: String,
    commands: mpsc::Sender<SupervisorCommand>,
    status: watch::Receiver<BrokerStatus>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn commands(&self) -> mpsc::Sender<SupervisorCommand> {
        self.commands.clone()
    }

    pub fn status(&self) -> BrokerStatus {
        self.status.borrow().clone()
    }

    /// Stops the supervisor: offline status, link closed, timers cancelled.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());

        let mut task = self.task;
        if time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("Supervisor for broker {} did not stop in time; aborting.", self.broker_id);
            task.abort();
        }
    }
}

struct ActiveLink {
    generation: u64,
    handle: LinkHandle,
    secure: bool,
    opened_at: Instant,
}

pub struct Supervisor {
    endpoint: BrokerEndpoint,
    client_id: String,
    ctx: SupervisorContext,

    state: ConnectionState,
    link: Option<ActiveLink>,
    generation: u64,
    using_plaintext_fallback: bool,
    reconnect_attempts: u32,
    reconnect_timer: Option<Interval>,
    reconnect_exhausted: bool,
    pending_connect: Option<Instant>,
    tracker: SubscriptionTracker,

    commands: mpsc::Receiver<SupervisorCommand>,
    stop: oneshot::Receiver<()>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal: mpsc::UnboundedReceiver<Internal>,
    lane: mpsc::Sender<InboundMessage>,
    status_tx: watch::Sender<BrokerStatus>,
}

/// Fresh client identifier, `iot-monitor-` followed by 13 random characters.
pub fn generate_client_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("iot-monitor-{}", &random[..13])
}

impl Supervisor {
    /// Spawns the supervisor task; it starts connecting right away.
    pub fn spawn(endpoint: BrokerEndpoint, ctx: SupervisorContext) -> SupervisorHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (stop_tx, stop) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let lane = ctx.forwarder.open_lane(&endpoint.id);
        let client_id = generate_client_id();

        let initial = BrokerStatus {
            broker_id: endpoint.id.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            state: ConnectionState::Disconnected,
            is_connected: false,
            subscribed_topics: Vec::new(),
            reconnect_attempts: 0,
            reconnect_timer_active: false,
            using_plaintext_fallback: false,
            client_id: client_id.clone(),
        };
        let (status_tx, status) = watch::channel(initial);
        let broker_id = endpoint.id.clone();

        let supervisor = Self {
            endpoint,
            client_id,
            ctx,
            state: ConnectionState::Disconnected,
            link: None,
            generation: 0,
            using_plaintext_fallback: false,
            reconnect_attempts: 0,
            reconnect_timer: None,
            reconnect_exhausted: false,
            pending_connect: None,
            tracker: SubscriptionTracker::new(),
            commands,
            stop,
            events_tx,
            events,
            internal_tx,
            internal,
            lane,
            status_tx,
        };

        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            broker_id,
            commands: commands_tx,
            status,
            stop: stop_tx,
            task,
        }
    }

    async fn run(mut self) {
        self.connect();

        loop {
            tokio::select! {
                // A dropped handle stops the supervisor as well.
                _ = &mut self.stop => {
                    self.shutdown();
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                Some((generation, event)) = self.events.recv() => {
                    self.handle_link_event(generation, event);
                }

                Some(internal) = self.internal.recv() => {
                    self.handle_internal(internal);
                }

                _ = next_tick(&mut self.reconnect_timer) => {
                    self.on_reconnect_tick();
                }

                _ = sleep_until(self.pending_connect) => {
                    self.pending_connect = None;
                    self.connect();
                }
            }
        }

        debug!("Supervisor for broker {} stopped.", self.endpoint.id);
    }

    fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Subscribe { topic, reply } => self.subscribe(topic, Some(reply)),
            SupervisorCommand::Unsubscribe { topic, reply } => self.unsubscribe(topic, Some(reply)),
            SupervisorCommand::Reconcile => {
                if self.state == ConnectionState::Connected {
                    self.spawn_reconcile();
                } else {
                    debug!("Broker {} not connected; reconcile deferred to next connect.", self.endpoint.id);
                }
            }
        }
    }

    fn connect(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return;
        }

        self.teardown_link();

        let force_plaintext = self.using_plaintext_fallback;
        let transport = match &self.endpoint.ca_cert {
            Some(ca_cert) if !force_plaintext && self.endpoint.port == SECURE_PORT => {
                TransportMode::Secure {
                    ca_cert: normalize_ca_cert(ca_cert),
                }
            }
            _ => TransportMode::Plain,
        };
        let port = if force_plaintext { INSECURE_PORT } else { self.endpoint.port };
        let secure = transport.is_secure();

        if secure {
            info!("🔐 Using TLS connection for broker {}:{}", self.endpoint.host, port);
        } else {
            info!(
                "🔓 Using plaintext connection for broker {}:{}{}",
                self.endpoint.host,
                port,
                if force_plaintext { " (fallback)" } else { "" }
            );
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;

        let options = LinkOptions {
            client_id: self.client_id.clone(),
            host: self.endpoint.host.clone(),
            port,
            username: self.endpoint.username.clone(),
            password: self.endpoint.password.clone(),
            transport,
            keep_alive: self.ctx.settings.keep_alive,
            connect_timeout: self.ctx.settings.connect_timeout,
        };

        info!(
            "Connecting to broker {}:{} with clientId {}...",
            self.endpoint.host, port, self.client_id
        );
        let handle = self
            .ctx
            .connector
            .open(options, LinkEvents::new(self.generation, self.events_tx.clone()));

        self.link = Some(ActiveLink {
            generation: self.generation,
            handle,
            secure,
            opened_at: Instant::now(),
        });
        self.publish_status();
    }

    /// Closes the current link, if any. Its late events are ignored afterwards, and
    /// nothing counts as subscribed until the next connection reconciles.
    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.handle.close();
        }
        self.tracker.abandon_pending();
        self.tracker.clear();
    }

    fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        let current = self.link.as_ref().map(|link| link.generation);
        if current != Some(generation) {
            debug!(
                "Ignoring event from stale link generation {} of broker {}.",
                generation, self.endpoint.id
            );
            return;
        }

        match event {
            LinkEvent::Connected => self.on_connected(),
            LinkEvent::Failed(err) => self.on_connect_error(err),
            LinkEvent::Closed(reason) => self.on_closed(&reason),
            LinkEvent::Message { topic, payload } => self.on_message(topic, payload),
        }
    }

    fn on_connected(&mut self) {
        info!("✅ Connected to broker {}:{}", self.endpoint.host, self.endpoint.port);

        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.reconnect_timer = None;
        self.pending_connect = None;

        if let Some(link) = &self.link {
            link.handle.publish(&status_topic(&self.client_id), STATUS_ONLINE, true);
        }

        self.spawn_reconcile();
        self.publish_status();
    }

    fn on_connect_error(&mut self, err: LinkError) {
        error!(
            "❌ Error connecting to broker {}:{}: {}",
            self.endpoint.host, self.endpoint.port, err
        );

        let secure = self.link.as_ref().is_some_and(|link| link.secure);
        self.teardown_link();
        self.state = ConnectionState::Disconnected;

        if secure && !self.using_plaintext_fallback && err.is_not_authorized() {
            warn!(
                "🔄 TLS authorization failed for broker {}, retrying in plaintext in {:?}.",
                self.endpoint.host, self.ctx.settings.fallback_delay
            );
            self.using_plaintext_fallback = true;
            self.pending_connect = Some(Instant::now() + self.ctx.settings.fallback_delay);
            self.publish_status();
            return;
        }

        self.start_reconnection();
        self.publish_status();
    }

    fn on_closed(&mut self, reason: &str) {
        warn!(
            "🔌 Disconnected from broker {}:{}: {}",
            self.endpoint.host, self.endpoint.port, reason
        );
        self.teardown_link();
        self.state = ConnectionState::Disconnected;
        self.start_reconnection();
        self.publish_status();
    }

    fn on_message(&mut self, topic: String, payload: Vec<u8>) {
        debug!(
            "📨 Message on '{}' from broker {} ({} bytes)",
            topic,
            self.endpoint.id,
            payload.len()
        );
        let message = InboundMessage {
            broker_id: self.endpoint.id.clone(),
            topic,
            payload,
        };
        if let Err(e) = self.lane.try_send(message) {
            warn!("Forwarding lane of broker {} is saturated; dropping message: {}", self.endpoint.id, e);
        }
    }

    fn start_reconnection(&mut self) {
        if self.reconnect_timer.is_some()
            || self.reconnect_exhausted
            || self.state == ConnectionState::Connected
        {
            return;
        }

        let period = self.ctx.settings.reconnect_interval;
        let mut timer = time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reconnect_timer = Some(timer);
    }

    fn on_reconnect_tick(&mut self) {
        if self.state == ConnectionState::Connected {
            self.reconnect_timer = None;
            self.publish_status();
            return;
        }

        self.reconnect_attempts += 1;
        let max = self.ctx.settings.max_reconnect_attempts;
        let mode = if self.using_plaintext_fallback { "plaintext" } else { "TLS" };
        info!(
            "🔄 Reconnection attempt {}/{} for broker {} ({})",
            self.reconnect_attempts, max, self.endpoint.host, mode
        );

        if self.reconnect_attempts >= max {
            error!(
                "❌ Max reconnection attempts reached for broker {}. Stopping reconnection.",
                self.endpoint.host
            );
            self.reconnect_timer = None;
            self.pending_connect = None;
            self.reconnect_exhausted = true;
            self.publish_status();
            return;
        }

        if self.state == ConnectionState::Connecting {
            let connect_timeout = self.ctx.settings.connect_timeout;
            let in_flight = self
                .link
                .as_ref()
                .is_some_and(|link| link.opened_at.elapsed() < connect_timeout);
            if in_flight {
                debug!("Connect attempt to broker {} still in flight.", self.endpoint.id);
                self.publish_status();
                return;
            }
            warn!(
                "Connect attempt to broker {} got no answer within {:?}; closing it.",
                self.endpoint.id, connect_timeout
            );
            self.teardown_link();
            self.state = ConnectionState::Disconnected;
        }

        // An attempt already scheduled keeps its deadline.
        if self.pending_connect.is_none() {
            self.pending_connect = Some(Instant::now() + self.ctx.settings.reconnect_delay);
        }
        self.publish_status();
    }

    fn subscribe(&mut self, topic: String, reply: Option<oneshot::Sender<bool>>) {
        if self.tracker.is_subscribed(&topic) {
            answer(reply, true);
            return;
        }

        let Some(link) = self.connected_link() else {
            warn!("❌ Broker {} not connected; cannot subscribe to '{}'.", self.endpoint.id, topic);
            answer(reply, false);
            return;
        };

        let generation = link.generation;
        let ack = {
            if !self.tracker.begin_subscribe(&topic, reply) {
                return;
            }
            match &self.link {
                Some(link) => link.handle.subscribe(&topic),
                None => return,
            }
        };

        let internal = self.internal_tx.clone();
        let timeout = self.ctx.settings.ack_timeout;
        tokio::spawn(async move {
            let acked = matches!(time::timeout(timeout, ack).await, Ok(Ok(true)));
            let _ = internal.send(Internal::SubscribeSettled { generation, topic, acked });
        });
    }

    fn unsubscribe(&mut self, topic: String, reply: Option<oneshot::Sender<bool>>) {
        if !self.tracker.is_subscribed(&topic) {
            answer(reply, true);
            return;
        }

        let Some(link) = self.connected_link() else {
            warn!("❌ Broker {} not connected; cannot unsubscribe from '{}'.", self.endpoint.id, topic);
            answer(reply, false);
            return;
        };

        let generation = link.generation;
        let ack = {
            if !self.tracker.begin_unsubscribe(&topic, reply) {
                return;
            }
            match &self.link {
                Some(link) => link.handle.unsubscribe(&topic),
                None => return,
            }
        };

        let internal = self.internal_tx.clone();
        let timeout = self.ctx.settings.ack_timeout;
        tokio::spawn(async move {
            let acked = matches!(time::timeout(timeout, ack).await, Ok(Ok(true)));
            let _ = internal.send(Internal::UnsubscribeSettled { generation, topic, acked });
        });
    }

    fn connected_link(&self) -> Option<&ActiveLink> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.link.as_ref()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connected_link().is_some_and(|link| link.generation == generation)
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SubscribeSettled { generation, topic, acked } => {
                if !self.is_current(generation) {
                    return;
                }
                if acked {
                    info!("📡 Subscribed to topic '{}' on broker {}", topic, self.endpoint.id);
                } else {
                    error!("❌ Subscription to '{}' on broker {} was not acknowledged.", topic, self.endpoint.id);
                }
                self.tracker.finish_subscribe(&topic, acked);
            }
            Internal::UnsubscribeSettled { generation, topic, acked } => {
                if !self.is_current(generation) {
                    return;
                }
                if acked {
                    info!("📡 Unsubscribed from topic '{}' on broker {}", topic, self.endpoint.id);
                } else {
                    error!("❌ Unsubscribe from '{}' on broker {} was not acknowledged.", topic, self.endpoint.id);
                }
                self.tracker.finish_unsubscribe(&topic, acked);
            }
            Internal::ActiveTopics { generation, topics } => {
                if !self.is_current(generation) {
                    debug!("Dropping active topic list for a superseded connection of broker {}.", self.endpoint.id);
                    return;
                }
                info!("📡 Found {} active topics for broker {}", topics.len(), self.endpoint.id);
                // Additive only: the set was emptied when the previous link went away, and
                // topics subscribed after this list was read must stay.
                for topic in topics {
                    self.subscribe(topic, None);
                }
            }
        }
        self.publish_status();
    }

    /// Loads the broker's active topics off-task, retrying store failures at a fixed delay.
    fn spawn_reconcile(&self) {
        let Some(generation) = self.link.as_ref().map(|link| link.generation) else {
            return;
        };
        let db = Arc::clone(&self.ctx.db);
        let internal = self.internal_tx.clone();
        let broker_id = self.endpoint.id.clone();
        let strategy = FixedInterval::new(self.ctx.settings.store_retry_delay);

        tokio::spawn(async move {
            let loaded = Retry::spawn(strategy, || {
                let db = Arc::clone(&db);
                let broker_id = broker_id.clone();
                let internal = internal.clone();
                async move {
                    if internal.is_closed() {
                        return Ok(None);
                    }
                    let query_id = broker_id.clone();
                    match db.run(move |db| db.active_topics_for_broker(&query_id)).await {
                        Ok(topics) => Ok(Some(topics)),
                        Err(e) => {
                            error!("❌ Error loading active topics for broker {}: {}", broker_id, e);
                            Err(e)
                        }
                    }
                }
            })
            .await;

            if let Ok(Some(topics)) = loaded {
                let _ = internal.send(Internal::ActiveTopics { generation, topics });
            }
        });
    }

    fn shutdown(&mut self) {
        if let Some(link) = self.connected_link() {
            link.handle.publish(&status_topic(&self.client_id), STATUS_OFFLINE, true);
        }
        self.teardown_link();
        self.reconnect_timer = None;
        self.pending_connect = None;
        self.state = ConnectionState::Disconnected;
        self.publish_status();
        info!("🔌 Disconnected from broker {}", self.endpoint.id);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(BrokerStatus {
            broker_id: self.endpoint.id.clone(),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            state: self.state,
            is_connected: self.state == ConnectionState::Connected,
            subscribed_topics: self.tracker.topics(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_timer_active: self.reconnect_timer.is_some(),
            using_plaintext_fallback: self.using_plaintext_fallback,
            client_id: self.client_id.clone(),
        });
    }
}

fn answer(reply: Option<oneshot::Sender<bool>>, outcome: bool) {
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
