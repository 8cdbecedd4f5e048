//! Transport session
//!
//! A [`TransportSession`] is one authenticated connection: it drives the
//! [`ConnectionState`] machine through the shared [`ConnectionNotifier`],
//! owns the [`FeatureRegistry`] for that connection, and runs the delivery
//! task that turns raw transport publishes into [`InboundMessage`]s routed to
//! the inboxes. A session is never reused; after disconnect or connection
//! loss the client builds a new one.

pub mod state;

pub use state::{ConnectionNotifier, ConnectionState, StateCallback};

use crate::auth::Credential;
use crate::config::MqttSection;
use crate::error::{ClientError, ClientResult};
use crate::feature::{Feature, FeatureRegistry};
use crate::inbox::InboxManager;
use crate::protocol::{InboundMessage, OutboundMessage, TopicBuilder, TopicKind};
use crate::session_span;
use crate::transport::{ConnectParams, RawDelivery, Transport, TransportError, TransportEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use ConnectionState::*;

/// How long disconnect waits for the delivery task to drain
const DELIVERY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TransportSession<T: Transport> {
    transport: Arc<T>,
    notifier: Arc<ConnectionNotifier>,
    inbox: Arc<InboxManager>,
    registry: Arc<FeatureRegistry>,
    credential: Credential,
    config: MqttSection,
    topics: TopicBuilder,
    cancel_tx: watch::Sender<bool>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> TransportSession<T> {
    pub fn new(
        transport: Arc<T>,
        notifier: Arc<ConnectionNotifier>,
        inbox: Arc<InboxManager>,
        credential: Credential,
        config: MqttSection,
    ) -> Self {
        let topics = TopicBuilder::new(credential.identity());
        let (cancel_tx, _) = watch::channel(false);
        Self {
            transport,
            notifier,
            inbox,
            registry: Arc::new(FeatureRegistry::new()),
            credential,
            config,
            topics,
            cancel_tx,
            delivery: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.notifier.current()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    fn client_id(&self) -> String {
        self.credential.identity().client_id()
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        match self.state() {
            Connected => Ok(()),
            state => Err(ClientError::not_connected(state)),
        }
    }

    /// Disconnected -> Connecting -> Connected
    ///
    /// A no-op returning the current state unless the session is
    /// disconnected. On failure the state returns to Disconnected. A
    /// concurrent [`disconnect`](Self::disconnect) cancels the attempt, which
    /// then fails with [`ClientError::ConnectionFailed`].
    pub async fn connect(&self) -> ClientResult<ConnectionState> {
        if let Err(current) = self.notifier.transition(&[Disconnected], Connecting) {
            debug!(state = %current, "Connect ignored");
            return Ok(current);
        }

        let client_id = self.client_id();
        let span = session_span!(client_id = %client_id, operation = "connect");
        self.establish().instrument(span).await
    }

    async fn establish(&self) -> ClientResult<ConnectionState> {
        let params = ConnectParams::from_credential(&self.credential, &self.config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(
            Self::run_delivery(
                events_rx,
                self.topics.clone(),
                self.registry.clone(),
                self.inbox.clone(),
                self.notifier.clone(),
            )
            .in_current_span(),
        );
        *self.delivery.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let mut cancel_rx = self.cancel_tx.subscribe();
        let result = tokio::select! {
            biased;
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                Err(TransportError::ConnectionFailed("connect cancelled by disconnect".to_string()))
            }
            result = self.transport.connect(params, events_tx) => result,
        };

        match result {
            Ok(()) => match self.notifier.transition(&[Connecting], Connected) {
                Ok(_) => {
                    info!("Session connected");
                    Ok(Connected)
                }
                Err(state) => {
                    warn!(state = %state, "Connection completed after disconnect was requested");
                    // The disconnect may have run before the link existed
                    if let Err(e) = self.transport.disconnect().await {
                        debug!(error = %e, "Transport cleanup after aborted connect");
                    }
                    Err(ClientError::connection_aborted(format!(
                        "connect cancelled, state is {state}"
                    )))
                }
            },
            Err(e) => {
                let error = ClientError::connection_failed(e);
                // Only clean up if disconnect has not taken over
                if self.notifier.transition(&[Connecting], Disconnected).is_ok() {
                    error!(error = %error, "Session connect failed");
                    if let Err(e) = self.transport.disconnect().await {
                        debug!(error = %e, "Transport cleanup after failed connect");
                    }
                    if let Some(handle) = self.take_delivery() {
                        handle.abort();
                    }
                }
                Err(error)
            }
        }
    }

    fn take_delivery(&self) -> Option<JoinHandle<()>> {
        self.delivery.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Connected or Connecting -> Disconnecting -> Disconnected
    ///
    /// Idempotent. Resolves once the transport is closed and every delivery
    /// received before the close has been routed to its inbox. Also cancels
    /// a connect that is in flight or has not begun yet.
    pub async fn disconnect(&self) -> ClientResult<ConnectionState> {
        // A connect that has not started yet must not start afterwards
        self.cancel_tx.send_replace(true);

        if let Err(current) = self
            .notifier
            .transition(&[Connected, Connecting], Disconnecting)
        {
            if current == Disconnecting {
                // Someone else is tearing down; wait for them to finish
                let mut state_rx = self.notifier.watch();
                let _ = state_rx.wait_for(|state| *state != Disconnecting).await;
            }
            return Ok(self.state());
        }

        let client_id = self.client_id();
        let span = session_span!(client_id = %client_id, operation = "disconnect");
        async {
            if let Err(e) = self.transport.disconnect().await {
                warn!(error = %e, "Transport disconnect failed");
            }

            // The transport dropped its event sender; let the delivery task drain
            if let Some(mut handle) = self.take_delivery() {
                match tokio::time::timeout(DELIVERY_DRAIN_TIMEOUT, &mut handle).await {
                    Ok(Ok(())) => debug!("Delivery task drained"),
                    Ok(Err(e)) if !e.is_cancelled() => warn!("Delivery task ended with error: {}", e),
                    Ok(Err(_)) => {}
                    Err(_) => {
                        warn!("Delivery task didn't drain in time, forcing abort");
                        handle.abort();
                    }
                }
            }

            self.registry.clear();
            let _ = self.notifier.transition(&[Disconnecting], Disconnected);
            info!("Session disconnected");
            Ok(Disconnected)
        }
        .instrument(span)
        .await
    }

    fn subscription_topic(&self, feature: Feature) -> ClientResult<String> {
        match feature {
            Feature::CloudToDevice => Ok(self.topics.c2d_subscription()),
            Feature::InputMessages => self.topics.input_subscription().ok_or_else(|| {
                ClientError::subscription_failed(feature, "input messages require a module identity")
            }),
        }
    }

    /// Subscribe to the topic backing a feature
    pub async fn subscribe(&self, feature: Feature) -> ClientResult<()> {
        self.ensure_connected()?;
        let topic = self.subscription_topic(feature)?;
        self.transport
            .subscribe(&topic)
            .await
            .map_err(|e| ClientError::subscription_failed(feature, e.to_string()))?;
        debug!(feature = %feature, topic = %topic, "Subscribed");
        Ok(())
    }

    /// Unsubscribe from the topic backing a feature
    pub async fn unsubscribe(&self, feature: Feature) -> ClientResult<()> {
        self.ensure_connected()?;
        let topic = self.subscription_topic(feature)?;
        self.transport
            .unsubscribe(&topic)
            .await
            .map_err(|e| ClientError::subscription_failed(feature, e.to_string()))?;
        debug!(feature = %feature, topic = %topic, "Unsubscribed");
        Ok(())
    }

    /// Enable a feature through the registry; idempotent
    pub async fn enable_feature(&self, feature: Feature) -> ClientResult<()> {
        self.ensure_connected()?;
        self.registry
            .enable(feature, || self.subscribe(feature))
            .await
    }

    /// Disable a feature through the registry; idempotent
    pub async fn disable_feature(&self, feature: Feature) -> ClientResult<()> {
        self.ensure_connected()?;
        self.registry
            .disable(feature, || self.unsubscribe(feature))
            .await
    }

    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        self.registry.is_enabled(feature)
    }

    /// Send a device-to-cloud telemetry message
    pub async fn publish(&self, message: &OutboundMessage) -> ClientResult<()> {
        self.ensure_connected()?;
        let topic = message.encode_topic(&self.topics.telemetry_topic());
        self.transport
            .publish(&topic, message.payload.clone())
            .await
            .map_err(ClientError::PublishFailed)?;
        debug!(topic = %topic, bytes = message.payload.len(), "Telemetry published");
        Ok(())
    }

    /// Consume transport events in receipt order until the transport lets go
    async fn run_delivery(
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        topics: TopicBuilder,
        registry: Arc<FeatureRegistry>,
        inbox: Arc<InboxManager>,
        notifier: Arc<ConnectionNotifier>,
    ) {
        while let Some(event) = events_rx.recv().await {
            match event {
                TransportEvent::Delivery(delivery) => {
                    Self::deliver(delivery, &topics, &registry, &inbox).await;
                }
                TransportEvent::ConnectionLost(reason) => {
                    if notifier.transition(&[Connected], Disconnected).is_ok() {
                        warn!(reason = %reason, "Connection lost");
                        registry.clear();
                    }
                }
            }
        }
        debug!("Delivery task finished");
    }

    async fn deliver(
        delivery: RawDelivery,
        topics: &TopicBuilder,
        registry: &FeatureRegistry,
        inbox: &InboxManager,
    ) {
        let result = match topics.classify(&delivery.topic) {
            TopicKind::CloudToDevice { property_bag } => {
                if !registry.is_enabled(Feature::CloudToDevice) {
                    warn!(topic = %delivery.topic, "C2D feature not enabled, dropping message");
                    return;
                }
                let message = InboundMessage::from_property_bag(delivery.payload, &property_bag);
                inbox.deliver_c2d(message).await
            }
            TopicKind::Input {
                input_name,
                property_bag,
            } => {
                if !registry.is_enabled(Feature::InputMessages) {
                    warn!(topic = %delivery.topic, "Input feature not enabled, dropping message");
                    return;
                }
                let mut message = InboundMessage::from_property_bag(delivery.payload, &property_bag);
                message.input_name = Some(input_name.clone());
                inbox.deliver_input(&input_name, message).await
            }
            TopicKind::Unknown => {
                warn!(topic = %delivery.topic, "Unrecognised topic, dropping message");
                return;
            }
        };

        if let Err(e) = result {
            warn!(topic = %delivery.topic, error = %e, "Message could not be delivered");
        }
    }
}

impl<T: Transport> Drop for TransportSession<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.take_delivery() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::connection_string::parse_connection_string;
    use crate::channel::ChannelPolicy;
    use crate::testing::MockTransport;

    const DEVICE: &str = "HostName=hub.azure-devices.net;DeviceId=dev;SharedAccessSignature=SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev&sig=abc&se=4102444800";

    fn session(transport: Arc<MockTransport>) -> TransportSession<MockTransport> {
        TransportSession::new(
            transport,
            Arc::new(ConnectionNotifier::new()),
            Arc::new(InboxManager::new(ChannelPolicy::Unbounded)),
            parse_connection_string(DEVICE).unwrap(),
            MqttSection::default(),
        )
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());

        assert_eq!(session.connect().await.unwrap(), Connected);
        assert_eq!(transport.connect_count(), 1);
        let params = transport.last_params().unwrap();
        assert_eq!(params.client_id, "dev");
        assert_eq!(params.username, "hub.azure-devices.net/dev/?api-version=2018-06-30");

        assert_eq!(session.disconnect().await.unwrap(), Disconnected);
        assert_eq!(session.disconnect().await.unwrap(), Disconnected);
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connect("broker unreachable");
        let session = session(transport);

        let result = session.connect().await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed { .. })));
        assert_eq!(session.state(), Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());

        let result = session.enable_feature(Feature::CloudToDevice).await;
        assert!(matches!(
            result,
            Err(ClientError::NotConnected { state: Disconnected })
        ));
        assert!(!session.is_feature_enabled(Feature::CloudToDevice));
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_enable_feature_subscribes_c2d_topic() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());
        session.connect().await.unwrap();

        session.enable_feature(Feature::CloudToDevice).await.unwrap();
        session.enable_feature(Feature::CloudToDevice).await.unwrap();

        assert_eq!(
            transport.subscriptions(),
            vec!["devices/dev/messages/devicebound/#".to_string()]
        );
        assert!(session.is_feature_enabled(Feature::CloudToDevice));

        session.disable_feature(Feature::CloudToDevice).await.unwrap();
        assert!(transport.subscriptions().is_empty());
        assert!(!session.is_feature_enabled(Feature::CloudToDevice));
    }

    #[tokio::test]
    async fn test_input_feature_requires_module() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport);
        session.connect().await.unwrap();

        let result = session.enable_feature(Feature::InputMessages).await;
        assert!(matches!(
            result,
            Err(ClientError::SubscriptionFailed {
                feature: Feature::InputMessages,
                ..
            })
        ));
        assert!(!session.is_feature_enabled(Feature::InputMessages));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());
        session.connect().await.unwrap();

        transport.fail_subscribes(true);
        let result = session.enable_feature(Feature::CloudToDevice).await;
        assert!(matches!(result, Err(ClientError::SubscriptionFailed { .. })));
        assert!(!session.is_feature_enabled(Feature::CloudToDevice));
    }

    #[tokio::test]
    async fn test_publish_encodes_properties() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());

        let message = OutboundMessage::new("23.5").with_property("unit", "C");
        assert!(matches!(
            session.publish(&message).await,
            Err(ClientError::NotConnected { .. })
        ));

        session.connect().await.unwrap();
        session.publish(&message).await.unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "devices/dev/messages/events/unit=C");
        assert_eq!(&published[0].1[..], b"23.5");
    }

    #[tokio::test]
    async fn test_deliveries_for_other_devices_are_dropped() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());
        session.connect().await.unwrap();
        session.enable_feature(Feature::CloudToDevice).await.unwrap();
        let mut stream = session.inbox.c2d().stream().unwrap();

        transport.deliver_c2d("other", "not mine", &[]);
        transport.deliver_c2d("dev", "mine", &[]);

        let message = stream.next().await.unwrap();
        assert_eq!(message.data(), b"mine");
    }

    #[tokio::test]
    async fn test_connection_loss_clears_features() {
        let transport = Arc::new(MockTransport::new());
        let session = session(transport.clone());
        session.connect().await.unwrap();
        session.enable_feature(Feature::CloudToDevice).await.unwrap();
        let mut state_rx = session.notifier.watch();

        transport.lose_connection("keep-alive timeout");
        state_rx
            .wait_for(|state| *state == Disconnected)
            .await
            .unwrap();

        assert!(!session.is_feature_enabled(Feature::CloudToDevice));
        assert!(!session.inbox.c2d().is_closed());
    }
}
