//! Mock transport for testing
//!
//! Stands in for the broker: records connects, subscriptions and publishes,
//! lets tests inject deliveries and connection loss, and can be told to fail.

use crate::transport::{ConnectParams, RawDelivery, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

pub type PublishedMessage = (String, Bytes);

#[derive(Debug, Default)]
struct MockState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    last_params: Option<ConnectParams>,
    connect_count: usize,
    disconnect_count: usize,
    subscribe_calls: usize,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    fail_next_connect: Option<String>,
    fail_subscribes: bool,
    fail_publishes: bool,
    connect_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
}

/// In-memory [`Transport`] that never touches the network
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next connect attempt fail with the given reason
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state().fail_next_connect = Some(reason.into());
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.state().fail_subscribes = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state().fail_publishes = fail;
    }

    /// Hold every connect attempt for `delay` before acknowledging it
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Hold every disconnect for `delay` before closing the link
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.state().disconnect_delay = Some(delay);
    }

    pub fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_count
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn last_params(&self) -> Option<ConnectParams> {
        self.state().last_params.clone()
    }

    /// Currently active subscriptions, in subscription order
    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Inject a publish as if the broker had sent it; false when not connected
    pub fn deliver(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> bool {
        let state = self.state();
        match &state.events {
            Some(events) => events
                .send(TransportEvent::Delivery(RawDelivery {
                    topic: topic.into(),
                    payload: payload.into(),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Inject a cloud-to-device message for `device_id` with custom properties
    pub fn deliver_c2d(
        &self,
        device_id: &str,
        payload: impl Into<Bytes>,
        properties: &[(&str, &str)],
    ) -> bool {
        let bag = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(properties)
            .finish();
        self.deliver(
            format!("devices/{device_id}/messages/devicebound/{bag}"),
            payload,
        )
    }

    /// Drop the link as a network failure would
    pub fn lose_connection(&self, reason: impl Into<String>) {
        let mut state = self.state();
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::ConnectionLost(reason.into()));
        }
        state.subscriptions.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.connect_count += 1;
        state.last_params = Some(params);
        if let Some(reason) = state.fail_next_connect.take() {
            return Err(TransportError::ConnectionRefused(reason));
        }
        state.events = Some(events);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let delay = self.state().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.disconnect_count += 1;
        state.events = None;
        state.subscriptions.clear();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribes {
            return Err(TransportError::SubscriptionFailed(
                format!("subscription to {topic} refused").into(),
            ));
        }
        if !state.subscriptions.iter().any(|t| t == topic) {
            state.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribes {
            return Err(TransportError::SubscriptionFailed(
                format!("unsubscribe from {topic} refused").into(),
            ));
        }
        state.subscriptions.retain(|t| t != topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.fail_publishes {
            return Err(TransportError::PublishFailed(
                format!("publish to {topic} refused").into(),
            ));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "hub".to_string(),
            port: 8883,
            client_id: "dev".to_string(),
            username: "hub/dev/?api-version=2018-06-30".to_string(),
            password: "sas".to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_lifecycle() {
        let transport = MockTransport::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        transport.connect(params(), events_tx).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.last_params(), Some(params()));

        assert!(transport.deliver_c2d("dev", "hi", &[("k", "v")]));
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Delivery(RawDelivery {
                topic: "devices/dev/messages/devicebound/k=v".to_string(),
                payload: Bytes::from_static(b"hi"),
            }))
        );

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(events_rx.recv().await.is_none());
        assert!(!transport.deliver("t", "late"));
    }

    #[tokio::test]
    async fn test_lose_connection_reports_then_closes() {
        let transport = MockTransport::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        transport.connect(params(), events_tx).await.unwrap();

        transport.lose_connection("network down");
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::ConnectionLost("network down".to_string()))
        );
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_delay_holds_the_link() {
        let transport = std::sync::Arc::new(MockTransport::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        transport.connect(params(), events_tx).await.unwrap();
        transport.set_disconnect_delay(Duration::from_millis(200));

        let closing = tokio::spawn({
            let transport = transport.clone();
            async move { transport.disconnect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.is_connected());

        closing.await.unwrap().unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_failures() {
        let transport = MockTransport::new();
        transport.fail_next_connect("nope");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.connect(params(), events_tx.clone()).await,
            Err(TransportError::ConnectionRefused(_))
        ));
        assert!(matches!(
            transport.subscribe("t").await,
            Err(TransportError::NotConnected)
        ));

        transport.connect(params(), events_tx).await.unwrap();
        transport.fail_subscribes(true);
        transport.fail_publishes(true);
        assert!(transport.subscribe("t").await.is_err());
        assert!(transport.publish("t", Bytes::new()).await.is_err());
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.subscribe_calls(), 2);
    }
}
