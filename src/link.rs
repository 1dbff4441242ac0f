//! Wire-level MQTT connection to one broker.
//!
//! A link is a single connection attempt: it is opened by a [`Connector`], reports what
//! happens on the wire as [`LinkEvent`]s tagged with the generation of the attempt, and
//! accepts [`LinkCommand`]s through its [`LinkHandle`]. A link never reconnects on its
//! own; after its first failure it stops and the owner decides what to do next.

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

pub const SECURE_PORT: u16 = 8883;
pub const INSECURE_PORT: u16 = 1883;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

const LINK_COMMAND_CAPACITY: usize = 64;
const EVENT_LOOP_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Topic carrying the online/offline status (and last will) of a client.
pub fn status_topic(client_id: &str) -> String {
    format!("{}/status", client_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    Plain,
    /// TLS, validating the broker chain against this PEM CA certificate.
    Secure { ca_cert: String },
}

impl TransportMode {
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportMode::Secure { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: TransportMode,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl LinkOptions {
    pub fn status_topic(&self) -> String {
        status_topic(&self.client_id)
    }

    fn to_mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(false);
        mqtt_options.set_last_will(LastWill::new(
            self.status_topic(),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let Some(username) = &self.username {
            mqtt_options.set_credentials(username, self.password.clone().unwrap_or_default());
        }

        if let TransportMode::Secure { ca_cert } = &self.transport {
            mqtt_options.set_transport(Transport::tls(ca_cert.clone().into_bytes(), None, None));
        }

        mqtt_options
    }
}

/// CONNACK refusal codes of MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    ProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl RefusalReason {
    fn from_code(code: ConnectReturnCode) -> Option<Self> {
        match code {
            ConnectReturnCode::Success => None,
            ConnectReturnCode::RefusedProtocolVersion => Some(Self::ProtocolVersion),
            ConnectReturnCode::BadClientId => Some(Self::BadClientId),
            ConnectReturnCode::ServiceUnavailable => Some(Self::ServiceUnavailable),
            ConnectReturnCode::BadUserNamePassword => Some(Self::BadCredentials),
            ConnectReturnCode::NotAuthorized => Some(Self::NotAuthorized),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("connection refused by broker: {0:?}")]
    Refused(RefusalReason),
    #[error("no CONNACK within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(String),
}

impl LinkError {
    /// True when the broker turned the client down as not authorized.
    pub fn is_not_authorized(&self) -> bool {
        match self {
            LinkError::Refused(reason) => *reason == RefusalReason::NotAuthorized,
            LinkError::Transport(message) => message.to_ascii_lowercase().contains("not authorized"),
            LinkError::Timeout(_) => false,
        }
    }
}

impl From<ConnectionError> for LinkError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => match RefusalReason::from_code(code) {
                Some(reason) => LinkError::Refused(reason),
                None => LinkError::Transport(format!("unexpected CONNACK {:?}", code)),
            },
            other => LinkError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    /// CONNACK accepted.
    Connected,
    /// The connection never came up.
    Failed(LinkError),
    /// An established connection was lost.
    Closed(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Sending side of a link's event stream, stamped with the attempt generation.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once nobody listens anymore.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[derive(Debug)]
pub enum LinkCommand {
    Subscribe { topic: String, ack: oneshot::Sender<bool> },
    Unsubscribe { topic: String, ack: oneshot::Sender<bool> },
    Publish { topic: String, payload: Vec<u8>, retain: bool },
    Close,
}

/// Owner's end of a link. Dropping it closes the link.
#[derive(Debug)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(commands: mpsc::Sender<LinkCommand>) -> Self {
        Self { commands }
    }

    /// Queues a QoS 1 SUBSCRIBE; the receiver resolves with the SUBACK outcome.
    pub fn subscribe(&self, topic: &str) -> oneshot::Receiver<bool> {
        let (ack, rx) = oneshot::channel();
        let command = LinkCommand::Subscribe { topic: topic.to_string(), ack };
        if let Err(e) = self.commands.try_send(command) {
            warn!("Link rejected SUBSCRIBE for '{}': {}", topic, e);
        }
        rx
    }

    /// Queues an UNSUBSCRIBE; the receiver resolves with the UNSUBACK outcome.
    pub fn unsubscribe(&self, topic: &str) -> oneshot::Receiver<bool> {
        let (ack, rx) = oneshot::channel();
        let command = LinkCommand::Unsubscribe { topic: topic.to_string(), ack };
        if let Err(e) = self.commands.try_send(command) {
            warn!("Link rejected UNSUBSCRIBE for '{}': {}", topic, e);
        }
        rx
    }

    pub fn publish(&self, topic: &str, payload: &str, retain: bool) {
        let command = LinkCommand::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain,
        };
        if let Err(e) = self.commands.try_send(command) {
            warn!("Link rejected PUBLISH to '{}': {}", topic, e);
        }
    }

    pub fn close(&self) {
        let _ = self.commands.try_send(LinkCommand::Close);
    }
}

/// Opens links. The production implementation speaks MQTT through rumqttc.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, options: LinkOptions, events: LinkEvents) -> LinkHandle;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    fn open(&self, options: LinkOptions, events: LinkEvents) -> LinkHandle {
        let (tx, rx) = mpsc::channel(LINK_COMMAND_CAPACITY);
        tokio::spawn(drive_link(options, rx, events));
        LinkHandle::new(tx)
    }
}

/// Requests waiting for their acknowledgement, matched by packet id.
///
/// rumqttc assigns packet ids inside the event loop and reports them through
/// `Outgoing` events in request order, so queued waiters are bound to ids FIFO.
#[derive(Default)]
struct AckQueue {
    queued: VecDeque<oneshot::Sender<bool>>,
    in_flight: HashMap<u16, oneshot::Sender<bool>>,
}

impl AckQueue {
    fn queue(&mut self, ack: oneshot::Sender<bool>) {
        self.queued.push_back(ack);
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(ack) = self.queued.pop_front() {
            self.in_flight.insert(pkid, ack);
        }
    }

    fn settle(&mut self, pkid: u16, ok: bool) {
        if let Some(ack) = self.in_flight.remove(&pkid) {
            let _ = ack.send(ok);
        }
    }
}

async fn drive_link(
    options: LinkOptions,
    mut commands: mpsc::Receiver<LinkCommand>,
    events: LinkEvents,
) {
    debug!(
        "Configuring MQTT link to {}:{} (generation {})...",
        options.host,
        options.port,
        events.generation()
    );

    let (client, mut eventloop) = AsyncClient::new(options.to_mqtt_options(), EVENT_LOOP_CAPACITY);
    let connect_deadline = time::sleep(options.connect_timeout);
    tokio::pin!(connect_deadline);

    let mut connected = false;
    let mut subscribes = AckQueue::default();
    let mut unsubscribes = AckQueue::default();

    loop {
        tokio::select! {
            _ = &mut connect_deadline, if !connected => {
                warn!("No CONNACK from {}:{} within {:?}", options.host, options.port, options.connect_timeout);
                events.emit(LinkEvent::Failed(LinkError::Timeout(options.connect_timeout)));
                break;
            }

            command = commands.recv() => match command {
                Some(LinkCommand::Subscribe { topic, ack }) => {
                    match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => subscribes.queue(ack),
                        Err(e) => {
                            warn!("Failed to queue SUBSCRIBE for '{}': {}", topic, e);
                            let _ = ack.send(false);
                        }
                    }
                }
                Some(LinkCommand::Unsubscribe { topic, ack }) => {
                    match client.try_unsubscribe(topic.as_str()) {
                        Ok(()) => unsubscribes.queue(ack),
                        Err(e) => {
                            warn!("Failed to queue UNSUBSCRIBE for '{}': {}", topic, e);
                            let _ = ack.send(false);
                        }
                    }
                }
                Some(LinkCommand::Publish { topic, payload, retain }) => {
                    if let Err(e) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload) {
                        warn!("Failed to queue PUBLISH to '{}': {}", topic, e);
                    }
                }
                Some(LinkCommand::Close) | None => {
                    if connected {
                        let _ = client.try_disconnect();
                        flush_disconnect(&mut eventloop).await;
                    }
                    debug!("MQTT link to {}:{} closed.", options.host, options.port);
                    break;
                }
            },

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    match RefusalReason::from_code(connack.code) {
                        None => {
                            connected = true;
                            info!("MQTT link to {}:{} accepted.", options.host, options.port);
                            if !events.emit(LinkEvent::Connected) {
                                break;
                            }
                        }
                        Some(reason) => {
                            events.emit(LinkEvent::Failed(LinkError::Refused(reason)));
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = LinkEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if !events.emit(message) {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    let granted = suback
                        .return_codes
                        .iter()
                        .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                    subscribes.settle(suback.pkid, granted);
                }
                Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                    unsubscribes.settle(unsuback.pkid, true);
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => subscribes.sent(pkid),
                Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => unsubscribes.sent(pkid),
                Ok(_) => {}
                Err(e) => {
                    let event = if connected {
                        LinkEvent::Closed(e.to_string())
                    } else {
                        LinkEvent::Failed(e.into())
                    };
                    events.emit(event);
                    break;
                }
            },
        }
    }
}

/// Lets the event loop write out queued packets and the DISCONNECT before dropping it.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    let _ = time::timeout(CLOSE_GRACE, drain).await;
}
