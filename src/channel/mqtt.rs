use crate::channel::manager::DeliveryManager;
use crate::channel::{ChannelError, DeviceChannel};
use crate::options::{OptionSet, OptionValue, Schema};
use async_trait::async_trait;
use derive_builder::Builder;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLIENT_ID_PREFIX: &str = "NadirBridge";
const TOPIC_PREFIX: &str = "nadir";

/// Options as they travel to the watch: app keys mapped to values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMessage {
    pub seq_id: u32,
    pub dictionary: BTreeMap<u32, OptionValue>,
}

/// Device answer to an [`AppMessage`]. An `error` means the watch refused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub seq_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckMessage {
    pub fn into_result(self) -> Result<(), ChannelError> {
        match self.error {
            None => Ok(()),
            Some(reason) => Err(ChannelError::Rejected(reason)),
        }
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct MqttChannelOptions {
    pub host: String,
    #[builder(default = "1883")]
    pub port: u16,
    #[builder(default)]
    pub user: Option<String>,
    #[builder(default)]
    pub password: Option<String>,
    /// Identifies the watch; used to derive the message and ack topics.
    pub device_id: String,
    #[builder(default = "Duration::from_secs(10)")]
    pub ack_timeout: Duration,
    #[builder(default)]
    pub schema: Schema,
}

impl MqttChannelOptions {
    pub fn builder() -> MqttChannelOptionsBuilder {
        MqttChannelOptionsBuilder::default()
    }

    pub fn message_topic(&self) -> String {
        format!("{TOPIC_PREFIX}/{}/appmessage", self.device_id)
    }

    pub fn ack_topic(&self) -> String {
        format!("{TOPIC_PREFIX}/{}/ack", self.device_id)
    }
}

fn generate_client_id() -> String {
    let uuid = Uuid::new_v4();
    format!("{CLIENT_ID_PREFIX}_{}", uuid.to_string().to_uppercase())
}

/// Device channel backed by an MQTT broker the watch companion listens on.
pub struct MqttChannel {
    client: AsyncClient,
    deliveries: Arc<DeliveryManager>,
    message_topic: String,
    ack_topic: String,
    seq_id: AtomicU32,
    ack_timeout: Duration,
    schema: Schema,
}

impl MqttChannel {
    pub async fn new(options: MqttChannelOptions) -> Result<Self, ChannelError> {
        let message_topic = options.message_topic();
        let ack_topic = options.ack_topic();

        let mut mqtt_options =
            MqttOptions::new(generate_client_id(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(5));
        if let (Some(user), Some(password)) = (&options.user, &options.password) {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
        info!(
            "Device channel using MQTT broker at {}:{}",
            options.host, options.port
        );

        client
            .subscribe(ack_topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                ChannelError::Connection(format!("Failed to subscribe to {ack_topic}: {e}"))
            })?;
        info!("Subscribed to topic: {}", ack_topic);

        let deliveries = Arc::new(DeliveryManager::new(options.ack_timeout));
        let deliveries_clone = Arc::clone(&deliveries);
        let ack_topic_clone = ack_topic.clone();
        tokio::spawn(async move {
            info!("Starting event loop");
            MqttChannel::run_eventloop(eventloop, deliveries_clone, ack_topic_clone).await
        });

        Ok(MqttChannel {
            client,
            deliveries,
            message_topic,
            ack_topic,
            seq_id: AtomicU32::new(1),
            ack_timeout: options.ack_timeout,
            schema: options.schema,
        })
    }

    pub async fn disconnect(self) -> Result<(), ChannelError> {
        self.client
            .unsubscribe(&self.ack_topic)
            .await
            .map_err(|e| ChannelError::Connection(format!("Unsubscribe error: {e}")))?;
        self.client
            .disconnect()
            .await
            .map_err(|e| ChannelError::Connection(format!("Disconnect error: {e}")))?;
        Ok(())
    }

    async fn run_eventloop(
        mut eventloop: EventLoop,
        deliveries: Arc<DeliveryManager>,
        ack_topic: String,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == ack_topic => {
                    match serde_json::from_slice::<AckMessage>(&publish.payload) {
                        Ok(ack) => {
                            let seq_id = ack.seq_id;
                            if !deliveries.complete(ack) {
                                debug!("Answer for unknown delivery {}", seq_id);
                            }
                        }
                        Err(e) => error!("Failed to parse device answer: {:?}", e),
                    }
                    deliveries.remove_expired();
                }
                Ok(_) => {}
                Err(e) => {
                    // rumqttc reconnects on the next poll
                    error!("Connection error: {:?}", e);
                    deliveries.remove_expired();
                    debug!("{} deliveries waiting for an answer", deliveries.pending_count());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for MqttChannel {
    async fn send(&self, options: OptionSet) -> Result<(), ChannelError> {
        let seq_id = self.seq_id.fetch_add(1, Ordering::Relaxed);
        let message = AppMessage {
            seq_id,
            dictionary: options.to_app_message(&self.schema),
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| ChannelError::Publish(format!("Serialization error: {e}")))?;

        // Register before publishing so a fast answer is not lost.
        let answer = self.deliveries.add_delivery(seq_id);
        info!("Sending app message: {payload}");
        if let Err(e) = self
            .client
            .publish(&self.message_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.deliveries.cancel(seq_id);
            return Err(ChannelError::Publish(format!(
                "Failed to publish app message: {e}"
            )));
        }

        await_answer(&self.deliveries, seq_id, answer, self.ack_timeout).await
    }
}

/// Waits for the device answer to `seq_id`. A delivery dropped by the sweep
/// resolves as [`ChannelError::Closed`].
async fn await_answer(
    deliveries: &DeliveryManager,
    seq_id: u32,
    answer: oneshot::Receiver<AckMessage>,
    ack_timeout: Duration,
) -> Result<(), ChannelError> {
    match tokio::time::timeout(ack_timeout, answer).await {
        Ok(Ok(ack)) => ack.into_result(),
        Ok(Err(_)) => Err(ChannelError::Closed),
        Err(_) => {
            warn!("App message {seq_id} was not answered");
            deliveries.cancel(seq_id);
            Err(ChannelError::Timeout(ack_timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionKey;

    #[test]
    fn test_app_message_wire_format() {
        let options = OptionSet::default()
            .with(OptionKey::Invert, "yes")
            .with(OptionKey::DateFormat, 3i64);
        let message = AppMessage {
            seq_id: 4,
            dictionary: options.to_app_message(&Schema::WithSeconds),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"seq_id":4,"dictionary":{"1":"yes","4":3}}"#
        );
    }

    #[test]
    fn test_ack_parsing() {
        let ack: AckMessage = serde_json::from_str(r#"{"seq_id":9}"#).unwrap();
        assert_eq!(ack.clone().into_result(), Ok(()));

        let nack: AckMessage =
            serde_json::from_str(r#"{"seq_id":9,"error":"APP_MSG_BUSY"}"#).unwrap();
        assert_eq!(
            nack.into_result(),
            Err(ChannelError::Rejected("APP_MSG_BUSY".into()))
        );
    }

    #[test]
    fn test_options_builder_defaults() {
        let options = MqttChannelOptions::builder()
            .host("broker.local")
            .device_id("pebble-1")
            .build()
            .unwrap();
        assert_eq!(options.port, 1883);
        assert_eq!(options.user, None);
        assert_eq!(options.ack_timeout, Duration::from_secs(10));
        assert_eq!(options.schema, Schema::WithSeconds);
        assert_eq!(options.message_topic(), "nadir/pebble-1/appmessage");
        assert_eq!(options.ack_topic(), "nadir/pebble-1/ack");
    }

    #[test]
    fn test_options_builder_requires_device() {
        assert!(MqttChannelOptions::builder().host("broker.local").build().is_err());
    }

    const ACK_TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_answer_acknowledged() {
        let deliveries = Arc::new(DeliveryManager::new(ACK_TIMEOUT));
        let answer = deliveries.add_delivery(1);
        let waiter = {
            let deliveries = Arc::clone(&deliveries);
            tokio::spawn(async move { await_answer(&deliveries, 1, answer, ACK_TIMEOUT).await })
        };

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(deliveries.complete(AckMessage {
            seq_id: 1,
            error: None
        }));
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert_eq!(deliveries.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_rejected() {
        let deliveries = DeliveryManager::new(ACK_TIMEOUT);
        let answer = deliveries.add_delivery(2);
        deliveries.complete(AckMessage {
            seq_id: 2,
            error: Some("APP_MSG_BUSY".into()),
        });
        assert_eq!(
            await_answer(&deliveries, 2, answer, ACK_TIMEOUT).await,
            Err(ChannelError::Rejected("APP_MSG_BUSY".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_delivery_times_out() {
        let deliveries = DeliveryManager::new(ACK_TIMEOUT);
        let answer = deliveries.add_delivery(3);
        assert_eq!(
            await_answer(&deliveries, 3, answer, ACK_TIMEOUT).await,
            Err(ChannelError::Timeout(ACK_TIMEOUT))
        );
        assert_eq!(deliveries.pending_count(), 0);

        // a late answer finds nothing to complete
        assert!(!deliveries.complete(AckMessage {
            seq_id: 3,
            error: None
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_swept_delivery_is_closed() {
        let deliveries = DeliveryManager::new(Duration::from_secs(1));
        let answer = deliveries.add_delivery(4);
        tokio::time::advance(Duration::from_secs(2)).await;
        deliveries.remove_expired();
        assert_eq!(
            await_answer(&deliveries, 4, answer, ACK_TIMEOUT).await,
            Err(ChannelError::Closed)
        );
    }
}
