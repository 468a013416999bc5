use crate::channel::{ChannelError, DeviceChannel};
use crate::options::{OptionSet, Schema};
use crate::store::{OPTIONS_KEY, PersistentStore, StoreError};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Stored options are malformed: {0}")]
    MalformedStoreData(#[source] serde_json::Error),
    #[error("Configuration page returned malformed options: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Invalid configuration page URL '{0}': {1}")]
    InvalidBaseUrl(String, url::ParseError),
    #[error("Configuration page URL '{0}' must not carry a fragment")]
    BaseUrlFragment(String),
    #[error("No async runtime to deliver options on")]
    NoRuntime,
}

/// Characters left as-is in a URI component, as browsers' `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// Reverses [`encode_component`]. Every `%` must start a two-digit hex escape
/// and the decoded bytes must be UTF-8.
pub fn decode_component(value: &str) -> Result<String, BridgeError> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return Err(BridgeError::MalformedPayload(format!(
                    "invalid percent escape at offset {i}"
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| BridgeError::MalformedPayload(e.to_string()))
}

/// Notifications delivered by the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Ready,
    ShowConfiguration,
    /// The configuration page was closed; an empty response means cancelled.
    WebviewClosed { response: String },
}

/// What the host can do on behalf of the bridge.
pub trait Host: Send + Sync {
    fn open_url(&self, url: &str);
}

/// Where the configuration page lives and which option fields it understands.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub base_url: Url,
    pub title: String,
    pub schema: Schema,
}

impl BridgeConfig {
    pub fn new(base_url: &str, title: &str, schema: Schema) -> Result<Self, BridgeError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| BridgeError::InvalidBaseUrl(base_url.to_string(), e))?;
        if parsed.fragment().is_some() {
            return Err(BridgeError::BaseUrlFragment(base_url.to_string()));
        }
        Ok(Self {
            base_url: parsed,
            title: title.to_string(),
            schema,
        })
    }

    /// Page URL pre-filled with `options`, or carrying only the title when
    /// there is nothing to pre-fill. Absent fields are left out.
    pub fn configuration_url(&self, options: Option<&OptionSet>) -> String {
        let mut uri = self.base_url.as_str().to_string();
        uri.push(if self.base_url.query().is_some() { '&' } else { '?' });
        uri.push_str("title=");
        uri.push_str(&encode_component(&self.title));
        if let Some(options) = options {
            for (key, value) in options.fields(&self.schema) {
                uri.push('&');
                uri.push_str(key.as_str());
                uri.push('=');
                uri.push_str(&encode_component(&value.to_string()));
            }
        }
        uri
    }
}

/// Result of handing options to the device channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    Rejected(String),
}

/// A delivery running in the background. Dropping it does not cancel it.
pub struct Delivery {
    handle: JoinHandle<DeliveryOutcome>,
}

impl Delivery {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn outcome(self) -> DeliveryOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome::Rejected(format!("delivery task failed: {e}")),
        }
    }
}

fn on_acknowledged() -> DeliveryOutcome {
    info!("options sent to device successfully");
    DeliveryOutcome::Acknowledged
}

fn on_rejected(e: ChannelError) -> DeliveryOutcome {
    warn!("options not sent to device: {e}");
    DeliveryOutcome::Rejected(e.to_string())
}

/// Keeps the stored options, the configuration page and the watch in step.
pub struct Bridge<S, C, H> {
    config: BridgeConfig,
    store: S,
    channel: Arc<C>,
    host: H,
    initialized: AtomicBool,
}

impl<S, C, H> Bridge<S, C, H>
where
    S: PersistentStore,
    C: DeviceChannel + 'static,
    H: Host,
{
    pub fn new(config: BridgeConfig, store: S, channel: Arc<C>, host: H) -> Self {
        Self {
            config,
            store,
            channel,
            host,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn ready(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        info!("host ready");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Last options written by the configuration page, if any.
    pub fn load_options(&self) -> Result<Option<OptionSet>, BridgeError> {
        match self.store.get(OPTIONS_KEY)? {
            Some(raw) => OptionSet::from_json(&raw)
                .map(Some)
                .map_err(BridgeError::MalformedStoreData),
            None => Ok(None),
        }
    }

    /// Opens the configuration page pre-filled with the stored options and
    /// returns the URL handed to the host.
    pub fn show_configuration(&self) -> String {
        let options = self.load_options().unwrap_or_else(|e| {
            warn!("ignoring stored options: {e}");
            None
        });
        match &options {
            Some(options) => info!("read options: {}", options.to_json()),
            None => info!("no stored options"),
        }
        info!("showing configuration");
        let uri = self.config.configuration_url(options.as_ref());
        debug!("Uri: {uri}");
        self.host.open_url(&uri);
        uri
    }

    /// Applies the configuration page's answer: store it, then push it to
    /// the watch. Returns `None` when the user cancelled.
    pub fn configuration_closed(&self, response: &str) -> Result<Option<Delivery>, BridgeError> {
        info!("configuration closed");
        if response.is_empty() {
            info!("no options received");
            return Ok(None);
        }
        let decoded = decode_component(response)?;
        let options = OptionSet::from_json(&decoded)
            .map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;
        // Checked before the store write: a stored set must always be sent.
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;

        let json = options.to_json();
        info!("storing options: {json}");
        self.store.set(OPTIONS_KEY, &json)?;

        Ok(Some(self.deliver(&runtime, options)))
    }

    fn deliver(&self, runtime: &Handle, options: OptionSet) -> Delivery {
        let channel = Arc::clone(&self.channel);
        let handle = runtime.spawn(async move {
            match channel.send(options).await {
                Ok(()) => on_acknowledged(),
                Err(e) => on_rejected(e),
            }
        });
        Delivery { handle }
    }

    /// Handles one host event. Returns the delivery started by a
    /// page-closed event, if any.
    pub fn handle_event(&self, event: HostEvent) -> Option<Delivery> {
        match event {
            HostEvent::Ready => {
                self.ready();
                None
            }
            HostEvent::ShowConfiguration => {
                self.show_configuration();
                None
            }
            HostEvent::WebviewClosed { response } => match self.configuration_closed(&response) {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!("options not applied: {e}");
                    None
                }
            },
        }
    }

    /// Handles host events one at a time until every sender is gone, then
    /// waits for deliveries still in flight.
    pub async fn run(&self, mut events: mpsc::Receiver<HostEvent>) {
        let mut in_flight: Vec<Delivery> = Vec::new();
        while let Some(event) = events.recv().await {
            in_flight.retain(|delivery| !delivery.is_finished());
            in_flight.extend(self.handle_event(event));
        }
        info!(
            "host event queue closed, {} deliveries in flight",
            in_flight.len()
        );
        for delivery in in_flight {
            delivery.outcome().await;
        }
    }
}
