//! Device client behaviour against the mock transport
//!
//! Covers the connection lifecycle, feature toggling, message delivery and
//! the guarantees consumers rely on around disconnect and connection loss.


use iothub_device::config::{ChannelPolicyKind, ChannelSection};
use iothub_device::testing::MockTransport;
use iothub_device::{
    AuthError, AuthenticationProvider, ClientConfig, ClientError, ConnectionState,
    ConnectionStringProvider, DeviceClient, OutboundMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_end_to_end_receive() {
    let (client, transport) = device_client();
    let states = record_states(&client);

    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
    client.enable_feature("c2d").await.unwrap();
    assert_eq!(
        transport.subscriptions(),
        vec!["devices/dev/messages/devicebound/#".to_string()]
    );

    let mut messages = client.messages().unwrap();
    assert!(transport.deliver_c2d("dev", "hello", &[("k", "v")]));

    let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(message.data(), b"hello");
    assert_eq!(
        message.custom_properties,
        HashMap::from([("k".to_string(), "v".to_string())])
    );

    client.disconnect().await.unwrap();
    assert!(timeout(WAIT, messages.next()).await.unwrap().is_none());
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_system_properties_are_decoded() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    client.enable_feature("c2d").await.unwrap();
    let mut messages = client.messages().unwrap();

    transport.deliver(
        "devices/dev/messages/devicebound/%24.mid=m-1&%24.cid=c-9&%24.ct=text%2Fplain&%24.to=%2Fdevices%2Fdev%2Fmessages%2FdeviceBound&color=blue",
        "payload",
    );

    let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(message.message_id.as_deref(), Some("m-1"));
    assert_eq!(message.correlation_id.as_deref(), Some("c-9"));
    assert_eq!(message.content_type.as_deref(), Some("text/plain"));
    assert_eq!(message.to.as_deref(), Some("/devices/dev/messages/deviceBound"));
    assert_eq!(message.custom_properties.len(), 1);
    assert_eq!(message.custom_properties["color"], "blue");
}

#[tokio::test]
async fn test_second_connect_is_a_no_op() {
    let (client, transport) = device_client();
    let states = record_states(&client);

    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);

    assert_eq!(transport.connect_count(), 1);
    let connected = states
        .lock()
        .unwrap()
        .iter()
        .filter(|state| **state == ConnectionState::Connected)
        .count();
    assert_eq!(connected, 1);
}

#[tokio::test]
async fn test_enable_before_connect_fails() {
    let (client, transport) = device_client();

    assert!(matches!(
        client.enable_feature("c2d").await,
        Err(ClientError::NotConnected {
            state: ConnectionState::Disconnected
        })
    ));
    assert!(!client.is_feature_enabled("c2d").unwrap());
    assert_eq!(transport.subscribe_calls(), 0);
}

#[tokio::test]
async fn test_enable_and_disable_are_idempotent() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();

    client.enable_feature("c2d").await.unwrap();
    client.enable_feature("c2d").await.unwrap();
    assert_eq!(transport.subscribe_calls(), 1);
    assert!(client.is_feature_enabled("c2d").unwrap());

    client.disable_feature("c2d").await.unwrap();
    client.disable_feature("c2d").await.unwrap();
    assert!(!client.is_feature_enabled("c2d").unwrap());
    assert!(transport.subscriptions().is_empty());
}

#[tokio::test]
async fn test_messages_for_disabled_feature_are_dropped() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    let mut messages = client.messages().unwrap();

    transport.deliver_c2d("dev", "early", &[]);
    client.enable_feature("c2d").await.unwrap();
    transport.deliver_c2d("dev", "late", &[]);

    let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(message.data(), b"late");
}

#[test]
fn test_malformed_connection_string_fails_before_connecting() {
    for connection_string in [
        "",
        "not a connection string",
        "HostName=hub.azure-devices.net;SharedAccessSignature=SharedAccessSignature sr=x&sig=y&se=1",
        "HostName=hub.azure-devices.net;DeviceId=dev;SharedAccessKey=a2V5",
    ] {
        let result = DeviceClient::from_connection_string(connection_string, ClientConfig::default());
        assert!(
            matches!(result, Err(ClientError::Auth(_))),
            "expected an auth error for {connection_string:?}"
        );
    }

    assert!(matches!(
        DeviceClient::from_connection_string(
            "HostName=hub.azure-devices.net;DeviceId=dev;SharedAccessKey=a2V5",
            ClientConfig::default()
        ),
        Err(ClientError::Auth(AuthError::SigningUnsupported))
    ));
}

#[tokio::test]
async fn test_disconnect_unblocks_consumer_exactly_once() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    client.enable_feature("c2d").await.unwrap();

    let mut messages = client.messages().unwrap();
    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(message) = messages.next().await {
            received.push(message);
        }
        // Reads after end-of-stream stay at end-of-stream
        assert!(messages.next().await.is_none());
        received
    });

    transport.deliver_c2d("dev", "one", &[]);
    transport.deliver_c2d("dev", "two", &[]);
    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();

    let received = timeout(WAIT, consumer).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = received.iter().map(|m| m.data()).collect();
    assert_eq!(payloads, vec![&b"one"[..], &b"two"[..]]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_single_consumer_per_channel() {
    let (client, _transport) = device_client();
    let first = client.messages().unwrap();

    assert!(matches!(
        client.messages(),
        Err(ClientError::ConsumerActive(_))
    ));

    drop(first);
    assert!(client.messages().is_ok());
}

#[tokio::test]
async fn test_connection_loss_then_reconnect() {
    let (client, transport) = device_client();
    let states = record_states(&client);
    client.connect().await.unwrap();
    client.enable_feature("c2d").await.unwrap();
    let mut messages = client.messages().unwrap();

    transport.lose_connection("keep-alive timeout");
    let mut state_rx = client.state_changes();
    timeout(
        WAIT,
        state_rx.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!client.is_feature_enabled("c2d").unwrap());

    // Channels stay open across the loss, so the same stream keeps working
    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
    client.enable_feature("c2d").await.unwrap();
    transport.deliver_c2d("dev", "after", &[]);

    let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(message.data(), b"after");
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let (client, transport) = device_client();
    transport.fail_next_connect("server unavailable");

    let error = client.connect().await.unwrap_err();
    assert!(matches!(error, ClientError::ConnectionFailed { .. }));
    assert!(error.is_retryable());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_disconnect_cancels_connect_in_flight() {
    let (client, transport) = device_client();
    transport.set_connect_delay(Duration::from_millis(500));
    let client = Arc::new(client);

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });

    let mut state_rx = client.state_changes();
    timeout(
        WAIT,
        state_rx.wait_for(|state| *state == ConnectionState::Connecting),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        client.disconnect().await.unwrap(),
        ConnectionState::Disconnected
    );

    let result = timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionFailed { .. })));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_reconnect_after_disconnect_reopens_channels() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    client.disconnect().await.unwrap();

    let mut messages = client.messages().unwrap();
    assert!(messages.next().await.is_none());
    drop(messages);

    client.connect().await.unwrap();
    client.enable_feature("c2d").await.unwrap();
    let mut messages = client.messages().unwrap();
    transport.deliver_c2d("dev", "second life", &[]);

    let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(message.data(), b"second life");
}

#[tokio::test]
async fn test_input_messages_for_modules() {
    let (client, transport) = mock_client(MODULE_CONNECTION_STRING, ClientConfig::default());
    let mut telemetry = client.input_messages("telemetry").unwrap();

    client.connect().await.unwrap();
    client.enable_feature("input").await.unwrap();
    assert_eq!(
        transport.subscriptions(),
        vec!["devices/edge/modules/filter/inputs/#".to_string()]
    );
    assert_eq!(transport.last_params().unwrap().client_id, "edge/filter");

    transport.deliver("devices/edge/modules/filter/inputs/unclaimed/", "ignored");
    transport.deliver(
        "devices/edge/modules/filter/inputs/telemetry/%24.mid=1&k=v",
        "reading",
    );

    let message = timeout(WAIT, telemetry.next()).await.unwrap().unwrap();
    assert_eq!(message.data(), b"reading");
    assert_eq!(message.input_name.as_deref(), Some("telemetry"));
    assert_eq!(message.message_id.as_deref(), Some("1"));
    assert_eq!(message.custom_properties["k"], "v");

    client.disconnect().await.unwrap();
    assert!(timeout(WAIT, telemetry.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_send_event_encodes_properties() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();

    let event = OutboundMessage::new(r#"{"temperature":21}"#)
        .with_content_type("application/json")
        .with_property("alert", "false");
    client.send_event(event).await.unwrap();

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].0,
        "devices/dev/messages/events/%24.ct=application%2Fjson&alert=false"
    );
    assert_eq!(&published[0].1[..], br#"{"temperature":21}"#);
}

#[tokio::test]
async fn test_send_event_failure_is_reported() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    transport.fail_publishes(true);

    assert!(matches!(
        client.send_event(OutboundMessage::new("x")).await,
        Err(ClientError::PublishFailed(_))
    ));
}

#[tokio::test]
async fn test_bounded_channel_waits_for_consumer() {
    let config = ClientConfig {
        channel: ChannelSection {
            policy: ChannelPolicyKind::Bounded,
            capacity: 1,
        },
        ..ClientConfig::default()
    };
    let (client, transport) = mock_client(DEVICE_CONNECTION_STRING, config);
    client.connect().await.unwrap();
    client.enable_feature("c2d").await.unwrap();

    for payload in ["a", "b", "c"] {
        transport.deliver_c2d("dev", payload, &[]);
    }

    let mut messages = client.messages().unwrap();
    for expected in [b"a", b"b", b"c"] {
        let message = timeout(WAIT, messages.next()).await.unwrap().unwrap();
        assert_eq!(message.data(), expected);
    }
}

#[tokio::test]
async fn test_connect_uses_gateway_and_sas_password() {
    let connection_string = "HostName=hub.azure-devices.net;DeviceId=dev;GatewayHostName=edge.local;SharedAccessSignature=SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev&sig=abc&se=4102444800";
    let (client, transport) = mock_client(connection_string, ClientConfig::default());
    client.connect().await.unwrap();

    let params = transport.last_params().unwrap();
    assert_eq!(params.host, "edge.local");
    assert_eq!(params.port, 8883);
    assert_eq!(
        params.username,
        "hub.azure-devices.net/dev/?api-version=2018-06-30"
    );
    assert_eq!(
        params.password,
        "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev&sig=abc&se=4102444800"
    );
}

#[tokio::test]
async fn test_reconnect_uses_renewed_signature() {
    let transport = Arc::new(MockTransport::new());
    let provider = Arc::new(ConnectionStringProvider::new(DEVICE_CONNECTION_STRING).unwrap());
    let client = DeviceClient::with_transport(
        provider.clone() as Arc<dyn AuthenticationProvider>,
        transport.clone(),
        ClientConfig::default(),
    );

    client.connect().await.unwrap();
    client.disconnect().await.unwrap();

    let renewed = "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev&sig=renewed&se=4102444900";
    provider.renew(renewed).unwrap();

    assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.last_params().unwrap().password, renewed);
}

#[tokio::test]
async fn test_concurrent_disconnects_wait_for_teardown() {
    let (client, transport) = device_client();
    client.connect().await.unwrap();
    transport.set_disconnect_delay(Duration::from_millis(300));
    let client = Arc::new(client);

    let mut state_rx = client.state_changes();
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.disconnect().await }
    });
    timeout(
        WAIT,
        state_rx.wait_for(|state| *state == ConnectionState::Disconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    // Connecting mid-teardown reports the teardown and leaves the transport alone
    assert_eq!(
        client.connect().await.unwrap(),
        ConnectionState::Disconnecting
    );
    assert_eq!(transport.connect_count(), 1);

    let second = timeout(WAIT, client.disconnect()).await.unwrap().unwrap();
    assert_eq!(second, ConnectionState::Disconnected);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    let first = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(first, ConnectionState::Disconnected);
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_connected());
}
