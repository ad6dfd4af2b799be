//! DoIP front
//!
//! Hosts the DoIP entity for every ECU that defines a logical address: a
//! UDP task answering vehicle identification requests and broadcasting
//! announcements, and a TCP task accepting one tester connection at a time.
//! Incoming diagnostic messages are acknowledged (positive 0x00 when some
//! ECU owns the target address, negative 0x03 otherwise) and routed through
//! the target ECU's `Raw` pattern tree.
//!
//! Script-triggered actions (`sendRaw`, `disconnectDoip`,
//! `sendDoipVehicleAnnouncements`) arrive over command channels and are
//! serialized by the owning task, so connection writes never race.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use doip_definitions::payload::{
    ActionCode, ActivationCode, AliveCheckResponse, DiagnosticAckCode, DiagnosticMessage,
    DiagnosticMessageAck, DiagnosticMessageNack, DiagnosticNackCode, DoipPayload,
    RoutingActivationResponse, VehicleAnnouncementMessage,
};
use doip_sockets::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DoipServerConfig;
use crate::error::SimulatorError;
use crate::hex;
use crate::model::{DoipPort, EcuModel};

pub const DOIP_PORT: u16 = 13400;

/// Poll granularity of the connection loop; commands and the inactivity
/// deadline are checked between reads.
const READ_SLICE: Duration = Duration::from_millis(100);

enum ConnectionCommand {
    SendDiagnostic { source: u16, data: Vec<u8> },
    Disconnect,
}

/// Command-channel handle registered with each hosted ECU's link.
struct DoipHandle {
    connection_tx: mpsc::UnboundedSender<ConnectionCommand>,
    announce_tx: mpsc::UnboundedSender<()>,
}

impl DoipPort for DoipHandle {
    fn send_diagnostic(&self, source: u16, data: Vec<u8>) {
        let _ = self
            .connection_tx
            .send(ConnectionCommand::SendDiagnostic { source, data });
    }

    fn disconnect(&self) {
        let _ = self.connection_tx.send(ConnectionCommand::Disconnect);
    }

    fn send_announcements(&self) {
        let _ = self.announce_tx.send(());
    }
}

pub struct DoipServer {
    config: DoipServerConfig,
    ecus: Vec<Arc<EcuModel>>,
    running: Arc<AtomicBool>,
}

impl DoipServer {
    pub fn new(config: DoipServerConfig, ecus: Vec<Arc<EcuModel>>, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            ecus,
            running,
        }
    }

    /// Start the UDP and TCP tasks and wire the command channels into the
    /// hosted ECUs.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();

        let handle = Arc::new(DoipHandle {
            connection_tx,
            announce_tx,
        });
        for ecu in &self.ecus {
            if let Some(address) = ecu.doip_logical_address {
                ecu.link().register_doip(handle.clone(), address);
            }
        }

        vec![
            tokio::spawn(udp_task(
                self.config.clone(),
                announce_rx,
                self.running.clone(),
            )),
            tokio::spawn(tcp_task(
                self.config,
                self.ecus,
                connection_rx,
                self.running,
            )),
        ]
    }
}

/// Route a diagnostic payload to the ECU owning `target`.
///
/// An unknown target is an [`SimulatorError::UnknownAddress`] (negative
/// diagnostic ACK at the protocol level); a pattern miss answers
/// service-not-supported; a matched empty response yields no bytes.
pub fn route_diagnostic(
    ecus: &[Arc<EcuModel>],
    target: u16,
    request: &[u8],
) -> Result<Vec<u8>, SimulatorError> {
    let ecu = ecus
        .iter()
        .find(|ecu| ecu.doip_logical_address == Some(target))
        .ok_or(SimulatorError::UnknownAddress(target))?;

    match ecu.raw_tree().matches(request) {
        Some(bound) => match ecu.evaluate(bound, request) {
            Some(response) if !response.trim().is_empty() => {
                Ok(hex::literal_hex_to_bytes(&response))
            }
            _ => Ok(Vec::new()),
        },
        None => Ok(vec![0x7F, request.first().copied().unwrap_or(0x00), 0x11]),
    }
}

async fn udp_task(
    config: DoipServerConfig,
    mut announce_rx: mpsc::UnboundedReceiver<()>,
    running: Arc<AtomicBool>,
) {
    let mut socket = match UdpSocket::bind(format!("0.0.0.0:{DOIP_PORT}")).await {
        Ok(socket) => socket,
        Err(err) => {
            error!(error = %err, "failed to bind DoIP UDP socket");
            return;
        }
    };
    info!(port = DOIP_PORT, "DoIP UDP listener up");

    send_announcements(&mut socket, &config).await;

    while running.load(Ordering::SeqCst) {
        while announce_rx.try_recv().is_ok() {
            send_announcements(&mut socket, &config).await;
        }
        match tokio::time::timeout(READ_SLICE, socket.recv()).await {
            Err(_) => continue,
            Ok(Some(Ok((message, peer)))) => {
                if let DoipPayload::VehicleIdentificationRequest(_) = message.payload {
                    debug!(%peer, "vehicle identification request");
                    let announcement = vehicle_announcement(&config);
                    if let Err(err) = socket
                        .send(DoipPayload::VehicleAnnouncementMessage(announcement), peer)
                        .await
                    {
                        warn!(error = %err, "failed to answer identification request");
                    }
                }
            }
            Ok(Some(Err(err))) => warn!(error = %err, "DoIP UDP receive error"),
            Ok(None) => break,
        }
    }
    debug!("DoIP UDP listener stopped");
}

/// Broadcast the configured number of vehicle announcements.
async fn send_announcements(socket: &mut UdpSocket, config: &DoipServerConfig) {
    let broadcast: SocketAddr = format!("255.255.255.255:{DOIP_PORT}").parse().unwrap();
    for _ in 0..config.announce_num {
        let announcement = vehicle_announcement(config);
        if let Err(err) = socket
            .send(DoipPayload::VehicleAnnouncementMessage(announcement), broadcast)
            .await
        {
            warn!(error = %err, "failed to send vehicle announcement");
        }
        tokio::time::sleep(Duration::from_millis(config.announce_interval_ms)).await;
    }
}

fn vehicle_announcement(config: &DoipServerConfig) -> VehicleAnnouncementMessage {
    let mut vin = [0u8; 17];
    let bytes = config.vin.as_bytes();
    let len = bytes.len().min(vin.len());
    vin[..len].copy_from_slice(&bytes[..len]);

    VehicleAnnouncementMessage {
        vin,
        logical_address: config.logical_address.to_be_bytes(),
        eid: config.eid,
        gid: config.gid,
        further_action: match config.further_action {
            0x10 => ActionCode::RoutingActivationRequired,
            _ => ActionCode::NoFurtherActionRequired,
        },
        vin_gid_sync: None,
    }
}

async fn tcp_task(
    config: DoipServerConfig,
    ecus: Vec<Arc<EcuModel>>,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    running: Arc<AtomicBool>,
) {
    let mut listener = match TcpListener::bind(format!("0.0.0.0:{DOIP_PORT}")).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind DoIP TCP listener");
            return;
        }
    };
    info!(port = DOIP_PORT, "DoIP TCP listener up");

    while running.load(Ordering::SeqCst) {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "DoIP tester connected");
                serve_connection(stream, &config, &ecus, &mut commands, &running).await;
                info!(%peer, "DoIP connection closed");
            }
            Err(err) => {
                error!(error = %err, "DoIP accept failed");
                break;
            }
        }
    }
    debug!("DoIP TCP listener stopped");
}

async fn serve_connection(
    mut stream: TcpStream,
    config: &DoipServerConfig,
    ecus: &[Arc<EcuModel>],
    commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    running: &Arc<AtomicBool>,
) {
    let inactivity = Duration::from_millis(config.general_inactivity_ms);
    let mut deadline = Instant::now() + inactivity;
    let mut tester_address: Option<u16> = None;

    while running.load(Ordering::SeqCst) {
        while let Ok(command) = commands.try_recv() {
            match command {
                ConnectionCommand::SendDiagnostic { source, data } => {
                    let Some(target) = tester_address else {
                        continue;
                    };
                    let message = DoipPayload::DiagnosticMessage(DiagnosticMessage {
                        source_address: source.to_be_bytes(),
                        target_address: target.to_be_bytes(),
                        message: data.into(),
                    });
                    if let Err(err) = stream.send(message).await {
                        warn!(error = %err, "scripted DoIP send failed");
                    }
                }
                ConnectionCommand::Disconnect => {
                    info!("script requested DoIP disconnect");
                    return;
                }
            }
        }

        if Instant::now() >= deadline {
            info!("DoIP general inactivity timeout");
            return;
        }

        match tokio::time::timeout(READ_SLICE, stream.read()).await {
            Err(_) => continue,
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                warn!(error = %err, "DoIP receive error");
                return;
            }
            Ok(Some(Ok(message))) => {
                deadline = Instant::now() + inactivity;
                handle_payload(&mut stream, message.payload, config, ecus, &mut tester_address)
                    .await;
            }
        }
    }
}

async fn handle_payload(
    stream: &mut TcpStream,
    payload: DoipPayload,
    config: &DoipServerConfig,
    ecus: &[Arc<EcuModel>],
    tester_address: &mut Option<u16>,
) {
    match payload {
        DoipPayload::RoutingActivationRequest(request) => {
            let source = u16::from_be_bytes(request.source_address);
            *tester_address = Some(source);
            info!(source = format!("0x{source:04X}"), "routing activation");
            let response = DoipPayload::RoutingActivationResponse(RoutingActivationResponse {
                logical_address: request.source_address,
                source_address: config.logical_address.to_be_bytes(),
                activation_code: ActivationCode::SuccessfullyActivated,
                buffer: [0; 4],
            });
            send_payload(stream, response).await;
        }
        DoipPayload::DiagnosticMessage(diagnostic) => {
            let target = u16::from_be_bytes(diagnostic.target_address);
            let tester = u16::from_be_bytes(diagnostic.source_address);
            *tester_address = Some(tester);
            debug!(
                target = format!("0x{target:04X}"),
                request = %hex::hex_string(&diagnostic.message),
                "DoIP diagnostic message"
            );

            match route_diagnostic(ecus, target, &diagnostic.message) {
                Ok(response) => {
                    let ack = DoipPayload::DiagnosticMessageAck(DiagnosticMessageAck {
                        source_address: target.to_be_bytes(),
                        target_address: tester.to_be_bytes(),
                        ack_code: DiagnosticAckCode::Acknowledged,
                    });
                    send_payload(stream, ack).await;

                    if !response.is_empty() {
                        let message = DoipPayload::DiagnosticMessage(DiagnosticMessage {
                            source_address: target.to_be_bytes(),
                            target_address: tester.to_be_bytes(),
                            message: response.into(),
                        });
                        send_payload(stream, message).await;
                    }
                }
                Err(_) => {
                    debug!(
                        target = format!("0x{target:04X}"),
                        "no ECU hosts the target address"
                    );
                    let nack = DoipPayload::DiagnosticMessageNack(DiagnosticMessageNack {
                        source_address: target.to_be_bytes(),
                        target_address: tester.to_be_bytes(),
                        nack_code: DiagnosticNackCode::UnknownTargetAddress,
                    });
                    send_payload(stream, nack).await;
                }
            }
        }
        DoipPayload::AliveCheckRequest(_) => {
            let response = DoipPayload::AliveCheckResponse(AliveCheckResponse {
                source_address: config.logical_address.to_be_bytes(),
            });
            send_payload(stream, response).await;
        }
        other => debug!(payload = ?std::mem::discriminant(&other), "unhandled DoIP payload"),
    }
}

async fn send_payload(stream: &mut TcpStream, payload: DoipPayload) {
    if let Err(err) = stream.send(payload).await {
        warn!(error = %err, "DoIP send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: &str = r#"
        Main = {
            DoIPLogicalEcuAddress = 0x0201,
            Raw = {
                ["22 F1 90"] = "62 F1 90" .. ascii("VIN42"),
                ["10 02"] = "",
            },
        }
    "#;

    fn ecus() -> Vec<Arc<EcuModel>> {
        vec![Arc::new(EcuModel::from_chunk("gateway", CHUNK).unwrap())]
    }

    #[test]
    fn matched_requests_route_to_the_target_ecu() {
        let ecus = ecus();
        let response = route_diagnostic(&ecus, 0x0201, &[0x22, 0xF1, 0x90]).unwrap();
        assert_eq!(&response[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&response[3..], b"VIN42");
    }

    #[test]
    fn unmatched_requests_answer_service_not_supported() {
        let ecus = ecus();
        let response = route_diagnostic(&ecus, 0x0201, &[0x19, 0x02, 0xFF]).unwrap();
        assert_eq!(response, vec![0x7F, 0x19, 0x11]);
    }

    #[test]
    fn matched_empty_response_yields_no_bytes() {
        let ecus = ecus();
        let response = route_diagnostic(&ecus, 0x0201, &[0x10, 0x02]).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn unknown_target_address_is_an_error() {
        let ecus = ecus();
        let err = route_diagnostic(&ecus, 0x0F0F, &[0x22, 0xF1, 0x90]).unwrap_err();
        assert!(matches!(err, SimulatorError::UnknownAddress(0x0F0F)));
    }

    #[test]
    fn announcement_carries_the_configured_identity() {
        let config = DoipServerConfig {
            vin: "SALGA2EV9HA298784".into(),
            logical_address: 0x0E00,
            ..Default::default()
        };
        let vam = vehicle_announcement(&config);
        assert_eq!(&vam.vin, b"SALGA2EV9HA298784");
        assert_eq!(u16::from_be_bytes(vam.logical_address), 0x0E00);
    }
}
