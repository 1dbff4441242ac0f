#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub id: String,
    pub topic: String,
    pub broker_id: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewBroker {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTopic {
    pub topic: String,
    pub broker_id: String,
    pub is_active: bool,
}

/// A broker record together with the topics currently flagged active for it.
#[derive(Debug, Clone)]
pub struct BrokerWithTopics {
    pub broker: Broker,
    pub topics: Vec<Topic>,
}

/// An active topic joined with the broker that owns it.
#[derive(Debug, Clone)]
pub struct ActiveTopic {
    pub topic: Topic,
    pub broker_host: String,
    pub broker_port: u16,
}

/// Connection parameters of one broker, as handed to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

impl From<Broker> for BrokerEndpoint {
    fn from(broker: Broker) -> Self {
        Self {
            id: broker.id,
            host: broker.host,
            port: broker.port,
            username: broker.username,
            password: broker.password,
            ca_cert: broker.ca_cert,
        }
    }
}
