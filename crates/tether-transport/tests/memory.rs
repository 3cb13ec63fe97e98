//! Integration tests for the in-memory transport.

use tether_transport::{
    ConnectionId, EventReceiver, MemoryHub, Transport, TransportError,
    TransportEvent,
};

fn drain(rx: &mut EventReceiver) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_host_reports_active_with_local_client() {
    let hub = MemoryHub::new();
    let (host, _rx) = hub.endpoint();

    host.connect_as_host("127.0.0.1", 7777).unwrap();

    assert!(host.is_server_active());
    assert!(host.is_client_connected());
    assert_eq!(host.local_client_id(), Some(ConnectionId::SERVER));
}

#[tokio::test]
async fn test_client_connect_notifies_both_sides() {
    let hub = MemoryHub::new();
    let (host, mut host_rx) = hub.endpoint();
    let (client, mut client_rx) = hub.endpoint();
    host.connect_as_host("127.0.0.1", 7777).unwrap();

    client.connect_as_client("127.0.0.1", 7777).unwrap();

    let id = client.local_client_id().expect("client should have an id");
    assert_ne!(id, ConnectionId::SERVER);
    assert_eq!(drain(&mut host_rx), vec![TransportEvent::Connected(id)]);
    assert_eq!(
        drain(&mut client_rx),
        vec![TransportEvent::Connected(ConnectionId::SERVER)]
    );
    assert_eq!(host.peer_count(), 1);
}

#[tokio::test]
async fn test_client_connect_without_host_is_unreachable() {
    let hub = MemoryHub::new();
    let (client, _rx) = hub.endpoint();

    let result = client.connect_as_client("10.0.0.1", 9000);

    assert!(matches!(result, Err(TransportError::Unreachable(_))));
    assert!(!client.is_client_connected());
}

#[tokio::test]
async fn test_second_host_on_same_address_is_rejected() {
    let hub = MemoryHub::new();
    let (a, _rx_a) = hub.endpoint();
    let (b, _rx_b) = hub.endpoint();
    a.connect_as_host("h", 1).unwrap();

    let result = b.connect_as_host("h", 1);

    assert!(matches!(result, Err(TransportError::AddressInUse(_))));
}

#[tokio::test]
async fn test_send_bytes_delivers_in_both_directions() {
    let hub = MemoryHub::new();
    let (host, mut host_rx) = hub.endpoint();
    let (client, mut client_rx) = hub.endpoint();
    host.connect_as_host("h", 1).unwrap();
    client.connect_as_client("h", 1).unwrap();
    let id = client.local_client_id().unwrap();
    drain(&mut host_rx);
    drain(&mut client_rx);

    client.send_bytes(ConnectionId::SERVER, b"up").unwrap();
    host.send_bytes(id, b"down").unwrap();

    assert_eq!(
        drain(&mut host_rx),
        vec![TransportEvent::Received {
            from: id,
            data: b"up".to_vec()
        }]
    );
    assert_eq!(
        drain(&mut client_rx),
        vec![TransportEvent::Received {
            from: ConnectionId::SERVER,
            data: b"down".to_vec()
        }]
    );
}

#[tokio::test]
async fn test_host_send_to_server_loops_back() {
    let hub = MemoryHub::new();
    let (host, mut rx) = hub.endpoint();
    host.connect_as_host("h", 1).unwrap();

    host.send_bytes(ConnectionId::SERVER, b"self").unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![TransportEvent::Received {
            from: ConnectionId::SERVER,
            data: b"self".to_vec()
        }]
    );
}

#[tokio::test]
async fn test_client_disconnect_notifies_host() {
    let hub = MemoryHub::new();
    let (host, mut host_rx) = hub.endpoint();
    let (client, mut client_rx) = hub.endpoint();
    host.connect_as_host("h", 1).unwrap();
    client.connect_as_client("h", 1).unwrap();
    let id = client.local_client_id().unwrap();
    drain(&mut host_rx);
    drain(&mut client_rx);

    client.disconnect();

    assert_eq!(drain(&mut host_rx), vec![TransportEvent::Disconnected(id)]);
    assert_eq!(
        drain(&mut client_rx),
        vec![TransportEvent::Disconnected(ConnectionId::SERVER)]
    );
    assert_eq!(host.peer_count(), 0);
    assert!(!client.is_client_connected());
}

#[tokio::test]
async fn test_host_disconnect_drops_every_client() {
    let hub = MemoryHub::new();
    let (host, _host_rx) = hub.endpoint();
    let (client, mut client_rx) = hub.endpoint();
    host.connect_as_host("h", 1).unwrap();
    client.connect_as_client("h", 1).unwrap();
    drain(&mut client_rx);

    host.disconnect();

    assert!(!host.is_server_active());
    assert!(!client.is_client_connected());
    assert_eq!(client.local_client_id(), None);
    assert_eq!(
        drain(&mut client_rx),
        vec![TransportEvent::Disconnected(ConnectionId::SERVER)]
    );

    // The address is free again.
    let (again, _rx) = hub.endpoint();
    again.connect_as_host("h", 1).unwrap();
}

#[tokio::test]
async fn test_send_while_idle_is_not_connected() {
    let hub = MemoryHub::new();
    let (idle, _rx) = hub.endpoint();

    let result = idle.send_bytes(ConnectionId::SERVER, b"x");

    assert!(matches!(result, Err(TransportError::NotConnected)));
}
