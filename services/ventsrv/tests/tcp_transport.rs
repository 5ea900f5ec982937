//! TcpTransport against the in-process simulator

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use ventsrv::error::VentSrvError;
use ventsrv::protocols::modbus::{
    Endpoint, ModbusSimulator, ModbusTransport, SimulatorWrite, TcpTransport,
};

async fn start_simulator() -> (ModbusSimulator, Endpoint) {
    let simulator = ModbusSimulator::new();
    let addr = simulator.start(0).await.unwrap();
    let endpoint = Endpoint::new("127.0.0.1", addr.port())
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(500));
    (simulator, endpoint)
}

/// One-client server that answers each 12-byte request frame with
/// whatever `reply` builds from it
async fn scripted_server(reply: fn(&[u8; 12]) -> Vec<u8>) -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            if socket.write_all(&reply(&request)).await.is_err() {
                break;
            }
        }
    });
    Endpoint::new("127.0.0.1", port)
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(500))
}

/// FC03 reply carrying one register, with the request's MBAP header
fn one_register_reply(request: &[u8; 12]) -> Vec<u8> {
    let mut frame = request[..7].to_vec();
    frame[4..6].copy_from_slice(&5u16.to_be_bytes());
    frame.extend_from_slice(&[0x03, 0x02, 0x00, 0x2A]);
    frame
}

#[tokio::test]
async fn test_read_holding_registers() {
    let (simulator, endpoint) = start_simulator().await;
    simulator.set_holding_register(6, 150).await;
    simulator.set_holding_register(7, 0xFF9C).await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let words = transport.read_holding_registers(6, 3).await.unwrap();
    assert_eq!(words, vec![150, 0xFF9C, 0]);

    transport.close().await;
    simulator.shutdown();
}

#[tokio::test]
async fn test_read_coils() {
    let (simulator, endpoint) = start_simulator().await;
    simulator.set_coil(40, true).await;
    simulator.set_coil(42, true).await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let coils = transport.read_coils(40, 3).await.unwrap();
    assert_eq!(coils, vec![true, false, true]);
    simulator.shutdown();
}

#[tokio::test]
async fn test_writes_are_applied_in_order() {
    let (simulator, endpoint) = start_simulator().await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    transport.write_single_register(135, 215).await.unwrap();
    transport.write_single_coil(40, true).await.unwrap();
    transport.write_single_coil(40, false).await.unwrap();

    assert_eq!(simulator.holding_register(135).await, Some(215));
    assert_eq!(simulator.coil(40).await, Some(false));
    assert_eq!(
        simulator.writes().await,
        vec![
            SimulatorWrite::Register {
                address: 135,
                value: 215
            },
            SimulatorWrite::Coil {
                address: 40,
                value: true
            },
            SimulatorWrite::Coil {
                address: 40,
                value: false
            },
        ]
    );
    simulator.shutdown();
}

#[tokio::test]
async fn test_exception_reply_keeps_session_usable() {
    let (simulator, endpoint) = start_simulator().await;
    simulator.set_holding_register(9, 42).await;
    simulator.inject_exception(8).await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let err = transport.read_holding_registers(8, 1).await.unwrap_err();
    assert!(matches!(err, VentSrvError::ProtocolError(_)));
    assert!(!err.is_transport());

    assert_eq!(transport.read_holding_registers(9, 1).await.unwrap(), vec![42]);
    simulator.shutdown();
}

#[tokio::test]
async fn test_slow_reply_times_out() {
    let (simulator, endpoint) = start_simulator().await;
    simulator
        .set_response_delay(Duration::from_millis(1500))
        .await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(matches!(err, VentSrvError::TimeoutError(_)));
    assert!(err.is_transport());
    simulator.shutdown();
}

#[tokio::test]
async fn test_dropped_socket_is_transport_error() {
    let (simulator, endpoint) = start_simulator().await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    assert!(transport.read_holding_registers(6, 1).await.is_ok());

    simulator.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);
    simulator.shutdown();
}

#[tokio::test]
async fn test_cancelled_exchange_poisons_transport() {
    let (simulator, endpoint) = start_simulator().await;
    simulator.set_holding_register(6, 150).await;
    simulator
        .set_response_delay(Duration::from_millis(200))
        .await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let cancelled = timeout(
        Duration::from_millis(50),
        transport.read_holding_registers(6, 1),
    )
    .await;
    assert!(cancelled.is_err());

    // The abandoned reply lands in the socket; the stream must not be reused
    simulator.set_response_delay(Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(matches!(err, VentSrvError::ConnectionError(_)));
    assert!(err.is_transport());

    // A fresh transport reads the real value
    let mut fresh = TcpTransport::connect(&endpoint).await.unwrap();
    assert_eq!(fresh.read_holding_registers(6, 1).await.unwrap(), vec![150]);
    simulator.shutdown();
}

#[tokio::test]
async fn test_wrong_transaction_id_is_transport_error() {
    let endpoint = scripted_server(|request| {
        let mut frame = one_register_reply(request);
        let tid = u16::from_be_bytes([frame[0], frame[1]]).wrapping_add(7);
        frame[..2].copy_from_slice(&tid.to_be_bytes());
        frame
    })
    .await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);

    // Still refused afterwards
    assert!(transport
        .read_holding_registers(6, 1)
        .await
        .unwrap_err()
        .is_transport());
}

#[tokio::test]
async fn test_wrong_unit_id_is_transport_error() {
    let endpoint = scripted_server(|request| {
        let mut frame = one_register_reply(request);
        frame[6] = frame[6].wrapping_add(1);
        frame
    })
    .await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_invalid_mbap_header_is_transport_error() {
    let endpoint = scripted_server(|request| {
        let mut frame = one_register_reply(request);
        // Protocol identifier must be zero
        frame[2..4].copy_from_slice(&1u16.to_be_bytes());
        frame
    })
    .await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    let err = transport.read_holding_registers(6, 1).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_matching_scripted_reply_is_accepted() {
    let endpoint = scripted_server(one_register_reply).await;

    let mut transport = TcpTransport::connect(&endpoint).await.unwrap();
    assert_eq!(transport.read_holding_registers(6, 1).await.unwrap(), vec![42]);
    assert_eq!(transport.read_holding_registers(7, 1).await.unwrap(), vec![42]);
}
