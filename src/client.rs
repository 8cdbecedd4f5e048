//! Device client facade
//!
//! [`DeviceClient`] ties an [`AuthenticationProvider`] and a [`Transport`] to
//! the per-feature inboxes. Each `connect()` builds a fresh
//! [`TransportSession`] from a freshly issued credential; the inboxes and the
//! connection-state observers outlive sessions, so consumers and callbacks
//! registered once keep working across reconnects.
//!
//! ```no_run
//! use iothub_device::{ClientConfig, DeviceClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DeviceClient::from_connection_string(
//!     "HostName=hub.azure-devices.net;DeviceId=dev;SharedAccessSignature=...",
//!     ClientConfig::default(),
//! )?;
//! client.on_connection_state(|state| println!("connection status: {state}"));
//! client.connect().await?;
//! client.enable_feature("c2d").await?;
//!
//! let mut messages = client.messages()?;
//! while let Some(message) = messages.next().await {
//!     println!("{}", message.data_lossy());
//! }
//! # Ok(())
//! # }
//! ```

use crate::auth::{AuthenticationProvider, ConnectionStringProvider, DeviceIdentity};
use crate::channel::MessageStream;
use crate::config::{ClientConfig, MqttSection};
use crate::error::{ClientError, ClientResult};
use crate::feature::Feature;
use crate::inbox::InboxManager;
use crate::protocol::OutboundMessage;
use crate::session::{ConnectionNotifier, ConnectionState, TransportSession};
use crate::transport::{MqttTransport, Transport};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct DeviceClient<T: Transport = MqttTransport> {
    auth: Arc<dyn AuthenticationProvider>,
    transport: Arc<T>,
    inbox: Arc<InboxManager>,
    notifier: Arc<ConnectionNotifier>,
    session: Mutex<Option<Arc<TransportSession<T>>>>,
    connect_lock: tokio::sync::Mutex<()>,
    config: MqttSection,
}

impl DeviceClient<MqttTransport> {
    /// Client over the MQTT transport
    pub fn new(auth: Arc<dyn AuthenticationProvider>, config: ClientConfig) -> Self {
        let transport = Arc::new(MqttTransport::new(config.mqtt.clone()));
        Self::with_transport(auth, transport, config)
    }

    /// Parse a device connection string and build an MQTT client for it
    ///
    /// A malformed string fails here, before any connection is attempted.
    pub fn from_connection_string(
        connection_string: &str,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let provider = ConnectionStringProvider::new(connection_string)?;
        Ok(Self::new(Arc::new(provider), config))
    }
}

impl<T: Transport> DeviceClient<T> {
    /// Client over any transport; the channel policy is fixed here
    pub fn with_transport(
        auth: Arc<dyn AuthenticationProvider>,
        transport: Arc<T>,
        config: ClientConfig,
    ) -> Self {
        Self {
            auth,
            transport,
            inbox: Arc::new(InboxManager::new(config.channel.policy())),
            notifier: Arc::new(ConnectionNotifier::new()),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            config: config.mqtt,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.auth.identity()
    }

    fn current_session(&self) -> Option<Arc<TransportSession<T>>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn connected_session(&self) -> ClientResult<Arc<TransportSession<T>>> {
        self.current_session()
            .ok_or_else(|| ClientError::not_connected(self.connection_state()))
    }

    /// Open a new session
    ///
    /// A no-op returning the current state unless the client is
    /// disconnected. The credential is requested first; failing to get one
    /// is fatal and no session is created.
    pub async fn connect(&self) -> ClientResult<ConnectionState> {
        let _connecting = self.connect_lock.lock().await;

        let current = self.connection_state();
        if current != ConnectionState::Disconnected {
            debug!(state = %current, "Already connected or in transition");
            return Ok(current);
        }

        let credential = self.auth.get_credential()?;
        info!(
            client_id = %credential.identity().client_id(),
            host = %credential.identity().connect_host(),
            "Connecting device client"
        );

        let session = Arc::new(TransportSession::new(
            self.transport.clone(),
            self.notifier.clone(),
            self.inbox.clone(),
            credential,
            self.config.clone(),
        ));
        {
            // Same lock as disconnect, so a disconnect sees either the old
            // inboxes and no session, or the reopened inboxes and this session
            let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
            self.inbox.reopen_all();
            *slot = Some(session.clone());
        }

        session.connect().await
    }

    /// Close the session and end every inbox stream
    ///
    /// Idempotent. Safe to call while a `connect()` is in flight, which then
    /// fails with [`ClientError::ConnectionFailed`]. Blocked consumers wake
    /// with end-of-stream once they have drained what was already delivered.
    pub async fn disconnect(&self) -> ClientResult<ConnectionState> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let state = match session {
            Some(session) => session.disconnect().await?,
            None => {
                // Another disconnect owns the session; wait for it to finish
                let mut state_rx = self.notifier.watch();
                let _ = state_rx
                    .wait_for(|state| *state == ConnectionState::Disconnected)
                    .await;
                ConnectionState::Disconnected
            }
        };

        self.inbox.close_all();
        Ok(state)
    }

    /// Enable a feature by name (`"c2d"`, `"input"`); idempotent
    pub async fn enable_feature(&self, name: &str) -> ClientResult<()> {
        let feature: Feature = name.parse()?;
        self.connected_session()?.enable_feature(feature).await
    }

    /// Disable a feature by name; idempotent
    pub async fn disable_feature(&self, name: &str) -> ClientResult<()> {
        let feature: Feature = name.parse()?;
        self.connected_session()?.disable_feature(feature).await
    }

    pub fn is_feature_enabled(&self, name: &str) -> ClientResult<bool> {
        let feature: Feature = name.parse()?;
        Ok(self
            .current_session()
            .is_some_and(|session| session.is_feature_enabled(feature)))
    }

    pub fn enabled_features(&self) -> Vec<Feature> {
        self.current_session()
            .map(|session| session.registry().enabled_features())
            .unwrap_or_default()
    }

    /// Register a callback for every connection state transition
    ///
    /// Register before `connect()` to see the whole sequence. Callbacks run
    /// one at a time in transition order and must not register observers.
    pub fn on_connection_state<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.notifier.add_observer(Box::new(callback));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.notifier.current()
    }

    /// Watch receiver for async observers; may skip intermediate states
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.notifier.watch()
    }

    /// Consumer handle for cloud-to-device messages
    pub fn messages(&self) -> ClientResult<MessageStream> {
        self.inbox.c2d().stream()
    }

    /// Consumer handle for one module input
    ///
    /// The inbox is created on first call; input messages arriving before
    /// that are dropped.
    pub fn input_messages(&self, input_name: &str) -> ClientResult<MessageStream> {
        self.inbox.input_or_create(input_name).stream()
    }

    /// Send a device-to-cloud telemetry message
    pub async fn send_event(&self, message: OutboundMessage) -> ClientResult<()> {
        self.connected_session()?.publish(&message).await
    }
}
