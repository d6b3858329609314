use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{distr::Alphanumeric, rng, RngExt};
use rumqttc::{AsyncClient, ConnectionError, MqttOptions, QoS};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::SendError, Receiver},
        watch,
    },
    task::JoinError,
};

use crate::{HomieTransport, MessageSender, TopicMessage, TransportError};

#[derive(Debug, Error)]
pub enum MqttTransportError {
    #[error("Error waiting for mqtt transport task to complete: {0} -- {0:#?}")]
    JoinError(#[from] JoinError),
    #[error("Mqtt transport channel is closed. Error sending event via mpsc::channel.")]
    ChannelClosed,
}
impl From<SendError<TransportEvent>> for MqttTransportError {
    fn from(_: SendError<TransportEvent>) -> Self {
        Self::ChannelClosed
    }
}

#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: Option<String>,
    pub mqtt_channel_size: usize,
    pub keep_alive: u64,
    pub max_packet_size_incoming: usize,
    pub max_packet_size_outgoing: usize,
    pub clean_session: bool,
    pub qos: QoS,
}

impl MqttClientConfig {
    /// Create a new instance with required fields and default optional fields
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: None,
            mqtt_channel_size: 65535,
            keep_alive: 5,
            max_packet_size_incoming: 512 * 1024,
            max_packet_size_outgoing: 512 * 1024,
            clean_session: true,
            qos: QoS::AtLeastOnce,
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        let id = client_id.into();
        if id.len() > 23 {
            log::warn!(
                "Client id [{}] is {} characters long, mqtt 3.1.1 brokers may reject more than 23",
                id,
                id.len()
            );
        }
        self.client_id = Some(id);
        self
    }

    pub fn mqtt_channel_size(mut self, mqtt_channel_size: usize) -> Self {
        self.mqtt_channel_size = mqtt_channel_size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u64) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn max_packet_size_incoming(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size_incoming = max_packet_size;
        self
    }

    pub fn max_packet_size_outgoing(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size_outgoing = max_packet_size;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn to_mqtt_options(&self) -> MqttOptions {
        let client_id = self.client_id.clone().unwrap_or_else(|| {
            format!(
                "homie-tree-{}",
                rng()
                    .sample_iter(&Alphanumeric)
                    .take(12)
                    .map(char::from)
                    .collect::<String>()
            )
        });
        let mut mqttoptions = MqttOptions::new(client_id, self.hostname.to_owned(), self.port);
        if !self.username.is_empty() && !self.password.is_empty() {
            mqttoptions.set_credentials(self.username.to_owned(), self.password.to_owned());
        }
        mqttoptions.set_keep_alive(Duration::from_secs(self.keep_alive));
        mqttoptions.set_clean_session(self.clean_session);
        mqttoptions
            .set_max_packet_size(self.max_packet_size_incoming, self.max_packet_size_outgoing);
        mqttoptions
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Connect,
    Disconnect,
    Stop,
    Error(ConnectionError),
}

type RouteTable = HashMap<String, Vec<MessageSender>>;

fn lock_routes(routes: &Mutex<RouteTable>) -> MutexGuard<'_, RouteTable> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`HomieTransport`] on top of a rumqttc [`AsyncClient`].
///
/// Inbound publishes are routed by exact topic to the handlers registered via `subscribe`.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    routes: Arc<Mutex<RouteTable>>,
    qos: QoS,
}

impl MqttTransport {
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Topics that currently have at least one live handler.
    pub fn subscribed_topics(&self) -> Vec<String> {
        lock_routes(&self.routes)
            .iter()
            .filter(|(_, handlers)| handlers.iter().any(|h| !h.is_closed()))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let payload = match std::str::from_utf8(payload) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("Dropping non utf-8 payload on [{}]: {}", topic, err);
                return;
            }
        };
        let mut routes = lock_routes(&self.routes);
        let Some(handlers) = routes.get_mut(topic) else {
            log::trace!("No handler for [{}]", topic);
            return;
        };
        handlers.retain(|handler| handler.send(TopicMessage::new(topic, payload)).is_ok());
        if handlers.is_empty() {
            routes.remove(topic);
        }
    }

    fn resubscribe_all(&self) {
        let topics = self.subscribed_topics();
        log::debug!("Resubscribing {} topics after reconnect", topics.len());
        for topic in topics {
            if let Err(err) = self.client.try_subscribe(topic.as_str(), self.qos) {
                log::error!("Error resubscribing [{}]: {}", topic, err);
            }
        }
    }
}

impl HomieTransport for MqttTransport {
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageSender,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        lock_routes(&self.routes)
            .entry(topic.to_owned())
            .or_default()
            .push(handler);
        let client = self.client.clone();
        let qos = self.qos;
        let topic = topic.to_owned();
        async move {
            client
                .subscribe(topic.clone(), qos)
                .await
                .map_err(|err| TransportError::Subscribe {
                    topic,
                    reason: err.to_string(),
                })
        }
    }

    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        let known = lock_routes(&self.routes).remove(topic).is_some();
        let client = self.client.clone();
        let topic = topic.to_owned();
        async move {
            if !known {
                return Ok(());
            }
            client
                .unsubscribe(topic.clone())
                .await
                .map_err(|err| TransportError::Unsubscribe {
                    topic,
                    reason: err.to_string(),
                })
        }
    }

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let client = self.client.clone();
        let qos = self.qos;
        let topic = topic.to_owned();
        let payload = payload.to_owned();
        async move {
            client
                .publish(topic.clone(), qos, retained, payload)
                .await
                .map_err(|err| TransportError::Publish {
                    topic,
                    reason: err.to_string(),
                })
        }
    }
}

pub struct MqttTransportHandle {
    stop_sender: watch::Sender<bool>, // Shutdown signal
    handle: tokio::task::JoinHandle<Result<(), MqttTransportError>>,
}

impl MqttTransportHandle {
    /// Stops the event loop task.
    pub async fn stop(self) -> Result<(), MqttTransportError> {
        let _ = self.stop_sender.send(true);
        self.handle.await??;
        Ok(())
    }
}

/// Connects to the broker described by `config` and drives the rumqttc event loop in a task.
pub fn run_mqtt_transport(
    config: &MqttClientConfig,
) -> (MqttTransportHandle, MqttTransport, Receiver<TransportEvent>) {
    let mqttoptions = config.to_mqtt_options();
    log::trace!("Connecting to mqtt: {}", mqttoptions.client_id());
    let (sender, receiver) = mpsc::channel(config.mqtt_channel_size);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, config.mqtt_channel_size);
    let (stop_sender, mut stop_receiver) = watch::channel(false);
    let transport = MqttTransport {
        client,
        routes: Arc::new(Mutex::new(HashMap::new())),
        qos: config.qos,
    };
    let router = transport.clone();

    let handle = tokio::task::spawn(async move {
        let mut connected = false;
        let mut connected_before = false;
        loop {
            let poll_res = tokio::select! {
                poll_res = eventloop.poll() => poll_res,
                _exit = stop_receiver.changed() => {
                    if *stop_receiver.borrow() {
                        log::trace!("Received stop signal. Exiting...");
                        break;
                    }
                    continue;
                }
            };

            match poll_res {
                Ok(event) => match &event {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        router.dispatch(&p.topic, &p.payload);
                    }
                    rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_)) => {
                        log::trace!("MQTT: Connected");
                        connected = true;
                        if connected_before {
                            router.resubscribe_all();
                        }
                        connected_before = true;
                        sender.send(TransportEvent::Connect).await?;
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        log::trace!("MQTT: Connection closed from our side.");
                        sender.send(TransportEvent::Disconnect).await?;
                        break;
                    }
                    _ => {}
                },

                Err(err) => {
                    if connected {
                        connected = false;
                        sender.send(TransportEvent::Disconnect).await?;
                    }

                    log::error!("MqttTransport: Error connecting mqtt. {:#?}", err);
                    sender.send(TransportEvent::Error(err)).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            };
        }
        sender.send(TransportEvent::Stop).await?;
        log::trace!("Exiting mqtt transport eventloop...");
        Ok(())
    });
    (
        MqttTransportHandle {
            handle,
            stop_sender,
        },
        transport,
        receiver,
    )
}
