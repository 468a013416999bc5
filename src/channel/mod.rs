mod manager;
mod mqtt;

pub use mqtt::{
    AckMessage, AppMessage, MqttChannel, MqttChannelOptions, MqttChannelOptionsBuilder,
    MqttChannelOptionsBuilderError,
};

use crate::options::OptionSet;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Device rejected the message: {0}")]
    Rejected(String),
    #[error("No acknowledgment within {0:?}")]
    Timeout(Duration),
    #[error("Publishing failed: {0}")]
    Publish(String),
    #[error("Channel connection failed: {0}")]
    Connection(String),
    #[error("Channel closed before the device answered")]
    Closed,
}

/// Best-effort path to the application running on the watch.
///
/// `send` resolves once the device has acknowledged or refused the options.
/// Callers that do not care about the outcome spawn it and move on.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn send(&self, options: OptionSet) -> Result<(), ChannelError>;
}
