/// Command channel — MQTT v5 request/response around the dispatcher.
///
/// Requests arrive on the configured queue topic. Each reply goes to the
/// request's response topic carrying the same correlation data. Publishes are
/// acknowledged by hand, only after the reply is out, and the broker may have
/// at most one unacknowledged request in flight, so commands run strictly one
/// at a time.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ClientError, Event, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command_log::{CommandLog, Direction};
use crate::device_config::BrokerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{DeviceError, DeviceResult};
use crate::network::is_loopback_host;
use crate::protocol::{to_hex, NOOP_ACK};

/// Where a reply must be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    pub topic: String,
    pub correlation: Bytes,
}

/// A reply needs both a response topic and correlation data.
pub fn reply_route(properties: Option<&PublishProperties>) -> Option<ReplyRoute> {
    let props = properties?;
    let topic = props.response_topic.clone().filter(|t| !t.is_empty())?;
    let correlation = props.correlation_data.clone()?;
    Some(ReplyRoute { topic, correlation })
}

fn transport(err: ClientError) -> DeviceError {
    DeviceError::TransportDisconnected(err.to_string())
}

fn client_id(config: &BrokerConfig, role: &str) -> String {
    config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("housedog-{}-{}", role, chrono::Utc::now().timestamp_millis()))
}

fn base_options(config: &BrokerConfig, id: String) -> MqttOptions {
    let mut options = MqttOptions::new(id, config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    if let Some(username) = config.username.clone() {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    options
}

/// Exit reason of one wait inside the serve loop.
enum Wake {
    Shutdown,
    NetworkChanged,
    MonitorGone,
}

pub struct MqRpcServer {
    config: BrokerConfig,
    dispatcher: Arc<CommandDispatcher>,
    log: Arc<CommandLog>,
}

impl MqRpcServer {
    pub fn new(config: BrokerConfig, dispatcher: Arc<CommandDispatcher>, log: Arc<CommandLog>) -> Self {
        Self {
            config,
            dispatcher,
            log,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = base_options(&self.config, client_id(&self.config, "device"));
        options.set_clean_start(true);
        options.set_manual_acks(true);
        options.set_receive_maximum(Some(1));
        options
    }

    /// Serve commands until `shutdown` flips to `true`. Transport failures
    /// are logged and retried forever; while the network is down nothing is
    /// attempted, unless the broker is on this host.
    pub async fn run(&self, mut network: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        info!(
            "MQ RPC connecting to {}:{} queue={}",
            self.config.host, self.config.port, self.config.queue
        );
        // Unmonitored: a local broker, or the monitor is gone and a lost
        // network is assumed to be back.
        let mut monitored = !is_loopback_host(&self.config.host);
        if !monitored {
            debug!("broker {} is local, not waiting for network", self.config.host);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if monitored && !*network.borrow_and_update() {
                self.log.record(Direction::Event, "no network");
                match wait_for_change(&mut network, &mut shutdown).await {
                    Wake::Shutdown => break,
                    Wake::NetworkChanged => continue,
                    Wake::MonitorGone => {
                        monitored = false;
                        continue;
                    }
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = network.changed(), if monitored => {
                    if changed.is_err() {
                        warn!("network monitor stopped");
                        monitored = false;
                    }
                }
                evt = eventloop.poll() => {
                    if let Err(e) = self.on_event(&client, evt).await {
                        error!("MQ RPC: {}", e);
                        self.log.record(Direction::Event, e.to_string());
                        if self.pause(&mut shutdown).await {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = client.disconnect().await {
            debug!("MQ RPC disconnect: {}", e);
        }
        drain(&mut eventloop).await;
        info!("MQ RPC stopped");
    }

    /// Sleep the reconnect delay. Returns `true` if shutdown was requested.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = tokio::time::sleep(self.config.reconnect_delay()) => false,
        }
    }

    async fn on_event(
        &self,
        client: &AsyncClient,
        evt: Result<Event, rumqttc::v5::ConnectionError>,
    ) -> DeviceResult<()> {
        match evt {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQ RPC listening with: {}", self.config.queue);
                self.log
                    .record(Direction::Event, format!("listening on {}", self.config.queue));
                client
                    .subscribe(self.config.queue.clone(), QoS::AtLeastOnce)
                    .await
                    .map_err(transport)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => self.on_publish(client, publish).await,
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                warn!("MQ RPC disconnected by broker");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(DeviceError::TransportDisconnected(e.to_string())),
        }
    }

    async fn on_publish(&self, client: &AsyncClient, publish: Publish) -> DeviceResult<()> {
        if publish.retain {
            // Left on the broker from before this session.
            debug!("ignoring retained message on {}", String::from_utf8_lossy(&publish.topic));
            return client.ack(&publish).await.map_err(transport);
        }

        let request = publish.payload.clone();
        self.log.record_bytes(Direction::Inbound, &request);

        let dispatcher = Arc::clone(&self.dispatcher);
        let reply = match tokio::task::spawn_blocking(move || dispatcher.handle(&request)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("command handler failed: {}", e);
                vec![NOOP_ACK]
            }
        };

        match reply_route(publish.properties.as_ref()) {
            Some(route) => {
                let properties = PublishProperties {
                    correlation_data: Some(route.correlation),
                    ..Default::default()
                };
                client
                    .publish_with_properties(route.topic, QoS::AtLeastOnce, false, reply.clone(), properties)
                    .await
                    .map_err(transport)?;
                self.log.record_bytes(Direction::Outbound, &reply);
            }
            None => warn!("request {} has no reply route, reply dropped", to_hex(&publish.payload)),
        }

        client.ack(&publish).await.map_err(transport)
    }
}

async fn wait_for_change(network: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) -> Wake {
    tokio::select! {
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                Wake::Shutdown
            } else {
                Wake::NetworkChanged
            }
        }
        changed = network.changed() => {
            if changed.is_err() {
                Wake::MonitorGone
            } else {
                Wake::NetworkChanged
            }
        }
    }
}

/// Let the event loop flush the disconnect packet.
async fn drain(eventloop: &mut EventLoop) {
    let _ = tokio::time::timeout(Duration::from_millis(500), async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
}

// ── Client side ──────────────────────────────────────────────────────────────

/// Send one command to a device and wait for its reply.
pub async fn request(config: &BrokerConfig, message: &[u8], timeout: Duration) -> DeviceResult<Vec<u8>> {
    let id = client_id(&BrokerConfig { client_id: None, ..config.clone() }, "cli");
    let response_topic = format!("{}/reply/{}", config.queue, id);
    let correlation = Bytes::from(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes().to_vec());

    let (client, mut eventloop) = AsyncClient::new(base_options(config, id), 10);
    let payload = Bytes::copy_from_slice(message);

    let exchange = async {
        loop {
            let evt = eventloop
                .poll()
                .await
                .map_err(|e| DeviceError::TransportDisconnected(e.to_string()))?;
            match evt {
                Event::Incoming(Packet::ConnAck(_)) => {
                    client
                        .subscribe(response_topic.clone(), QoS::AtLeastOnce)
                        .await
                        .map_err(transport)?;
                }
                Event::Incoming(Packet::SubAck(_)) => {
                    let properties = PublishProperties {
                        response_topic: Some(response_topic.clone()),
                        correlation_data: Some(correlation.clone()),
                        ..Default::default()
                    };
                    client
                        .publish_with_properties(
                            config.queue.clone(),
                            QoS::AtLeastOnce,
                            false,
                            payload.clone(),
                            properties,
                        )
                        .await
                        .map_err(transport)?;
                    debug!(">> {}", to_hex(&payload));
                }
                Event::Incoming(Packet::Publish(p)) => {
                    let matches = p
                        .properties
                        .as_ref()
                        .and_then(|props| props.correlation_data.as_ref())
                        .is_some_and(|c| *c == correlation);
                    if matches {
                        debug!("<< {}", to_hex(&p.payload));
                        return Ok::<Vec<u8>, DeviceError>(p.payload.to_vec());
                    }
                }
                _ => {}
            }
        }
    };

    let result = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| DeviceError::ResourceUnavailable(format!("no reply within {:?}", timeout)))
        .and_then(|r| r);

    let _ = client.disconnect().await;
    drain(&mut eventloop).await;
    result
}
