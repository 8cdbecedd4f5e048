//! Impure I/O operations for the MQTT transport
//!
//! Owns the rumqttc client handle and the event loop task for the current
//! connection. Routing decisions live in [`super::message_handler`], option
//! handling in [`super::connection`].

use super::connection::{configure_mqtt_options, LinkState};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::error::sanitize_error_message;
use crate::mqtt_span;
use crate::transport::{ConnectParams, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Client handle and event loop task of one live connection
struct ActiveConnection {
    id: u64,
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ActiveConnection {
    /// Stop the event loop without waiting for a DISCONNECT to go out
    fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

fn take_connection(
    active: &Mutex<Option<ActiveConnection>>,
    id: u64,
) -> Option<ActiveConnection> {
    let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
    if active.as_ref().is_some_and(|connection| connection.id == id) {
        active.take()
    } else {
        None
    }
}

/// Tears down the connection installed by a `connect` call that never finished
///
/// A cancelled connect future drops this guard; without it the event loop
/// would outlive a disconnect that ran before the connection was installed.
struct PendingConnect<'a> {
    active: &'a Mutex<Option<ActiveConnection>>,
    id: u64,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(active: &'a Mutex<Option<ActiveConnection>>, id: u64) -> Self {
        Self {
            active,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(connection) = take_connection(self.active, self.id) {
            debug!(connection = self.id, "Connect abandoned, stopping its event loop");
            connection.abort();
        }
    }
}

/// MQTT transport backed by rumqttc
///
/// One instance is reused across connects; each `connect` builds a fresh
/// rumqttc client and event loop from the parameters it is given.
pub struct MqttTransport {
    config: MqttSection,
    active: Mutex<Option<ActiveConnection>>,
    next_id: AtomicU64,
}

impl MqttTransport {
    pub fn new(config: MqttSection) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create link state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (watch::Sender<LinkState>, watch::Receiver<LinkState>),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(LinkState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    LinkState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "Event loop stopped before ConnAck".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.lock_active()
            .as_ref()
            .map(|active| active.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Poll the event loop until shutdown, local disconnect or link failure
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<LinkState>,
        mut shutdown_rx: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<TransportEvent>,
        client_id: String,
    ) {
        info!(client_id = %client_id, "Starting MQTT event loop");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(client_id = %client_id, "Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &state_tx, &events) {
                                break;
                            }
                        }
                        Err(e) => {
                            let reason = sanitize_error_message(&e.to_string());
                            let was_connected = *state_tx.borrow() == LinkState::Connected;
                            state_tx.send_replace(LinkState::Disconnected(reason.clone()));

                            if was_connected {
                                error!(client_id = %client_id, error = %reason, "MQTT connection lost");
                                let _ = events.send(TransportEvent::ConnectionLost(reason));
                            } else {
                                warn!(client_id = %client_id, error = %reason, "MQTT connection attempt failed");
                            }
                            break;
                        }
                    }
                }
            }
        }

        info!(client_id = %client_id, "MQTT event loop stopped");
    }

    /// Act on a routed event; returns false when the loop should stop
    fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<LinkState>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                state_tx.send_replace(LinkState::Connected);
                true
            }
            EventRoute::ConnectionRefused(reason) => {
                warn!(reason = %reason, "Broker refused the connection");
                state_tx.send_replace(LinkState::Disconnected(format!(
                    "connection refused: {reason}"
                )));
                false
            }
            EventRoute::MessageReceived(delivery) => {
                debug!(target: "mqtt_transport", topic = %delivery.topic, bytes = delivery.payload.len(), "Publish received");
                if events.send(TransportEvent::Delivery(delivery)).is_err() {
                    debug!(target: "mqtt_transport", "No session is listening; delivery discarded");
                }
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                failures,
            } => {
                if failures > 0 {
                    warn!(packet_id, failures, "Broker rejected subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::Disconnected => {
                let was_connected = *state_tx.borrow() == LinkState::Connected;
                let reason = "broker closed the connection".to_string();
                state_tx.send_replace(LinkState::Disconnected(reason.clone()));
                if was_connected {
                    let _ = events.send(TransportEvent::ConnectionLost(reason));
                }
                false
            }
            EventRoute::DisconnectRequested => {
                state_tx.send_replace(LinkState::Disconnected("client disconnected".to_string()));
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Stop an event loop task, first gracefully, then by force
    async fn shutdown(active: ActiveConnection) {
        let ActiveConnection {
            id: _,
            client,
            shutdown_tx,
            mut handle,
        } = active;

        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "Disconnect request not accepted; event loop already stopped");
            let _ = shutdown_tx.send(true);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                let _ = shutdown_tx.send(true);
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mqtt_options = configure_mqtt_options(&params, &self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.config.request_capacity);

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();

        info!(
            host = %params.host,
            port = params.port,
            client_id = %params.client_id,
            "Connecting to MQTT broker"
        );
        let span = mqtt_span!(client_id = %params.client_id, host = %params.host);
        let handle = tokio::spawn(
            Self::run_event_loop(
                event_loop,
                state_tx,
                shutdown_rx,
                events,
                params.client_id.clone(),
            )
            .instrument(span),
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.lock_active().replace(ActiveConnection {
            id,
            client,
            shutdown_tx,
            handle,
        });
        let mut pending = PendingConnect::new(&self.active, id);
        if let Some(previous) = previous {
            if previous.handle.is_finished() {
                debug!("Clearing connection left behind by a lost link");
            } else {
                warn!("Replacing a connection that was never disconnected");
            }
            Self::shutdown(previous).await;
        }

        match Self::wait_for_connection_confirmation(state_rx, self.config.connect_timeout()).await
        {
            Ok(()) => {
                pending.disarm();
                info!(client_id = %params.client_id, "MQTT connection acknowledged");
                Ok(())
            }
            Err(e) => {
                pending.disarm();
                if let Some(failed) = take_connection(&self.active, id) {
                    Self::shutdown(failed).await;
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let active = self.lock_active().take();
        match active {
            Some(active) => {
                Self::shutdown(active).await;
                info!("MQTT transport disconnected");
            }
            None => debug!("MQTT transport already disconnected"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;
        debug!(topic, "Subscribe request queued");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;
        debug!(topic, "Unsubscribe request queued");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // No async in Drop; callers should disconnect() for a clean DISCONNECT
        if let Some(active) = self.lock_active().take() {
            active.abort();
        }
    }
}
