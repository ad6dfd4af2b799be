//! UDS over ISO-TP front
//!
//! One receive thread per ECU on the physical address pair plus one on the
//! functional broadcast address. Requests are first matched against the
//! `Raw` pattern tree; unmatched requests fall back to the built-in
//! services (ReadDataByIdentifier, DiagnosticSessionControl,
//! SecurityAccess), everything else answers service-not-supported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socketcan::{ExtendedId, Id, StandardId};
use socketcan_isotp::IsoTpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::SimulatorError;
use crate::hex;
use crate::model::{DiagnosticTx, EcuModel, UdsSession};
use crate::session::{self, SessionTimer, SESSION_TIMEOUT};

/// UDS service identifiers handled by the built-in dispatch.
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// UDS negative response codes emitted by this front.
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
}

/// Default negative response for this front.
fn negative_response(service: u8) -> Vec<u8> {
    vec![
        service_id::NEGATIVE_RESPONSE,
        service,
        nrc::SERVICE_NOT_SUPPORTED,
    ]
}

/// ISO-TP sender registered with the script link for `sendRaw`.
struct IsoTpTx(Arc<Mutex<IsoTpSocket>>);

impl DiagnosticTx for IsoTpTx {
    fn send(&self, data: &[u8]) {
        if let Err(err) = self.0.lock().write(data) {
            error!(?err, "sendRaw via ISO-TP failed");
        }
    }
}

pub struct UdsSimulator {
    model: Arc<EcuModel>,
    timer: Arc<SessionTimer>,
}

impl UdsSimulator {
    /// A script participates in the UDS front when it defines both CAN ids.
    pub fn has_simulation(model: &EcuModel) -> bool {
        model.request_id.is_some() && model.response_id.is_some()
    }

    pub fn new(model: Arc<EcuModel>) -> Self {
        Self {
            model,
            timer: Arc::new(SessionTimer::new(SESSION_TIMEOUT)),
        }
    }

    /// Open the ISO-TP sockets and start the receive threads.
    pub fn spawn(
        self,
        device: &str,
        running: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, SimulatorError> {
        let request_id = self
            .model
            .request_id
            .ok_or_else(|| SimulatorError::InvalidConfig("missing RequestId".into()))?;
        let response_id = self
            .model
            .response_id
            .ok_or_else(|| SimulatorError::InvalidConfig("missing ResponseId".into()))?;

        let physical = open_socket(device, request_id, response_id)?;
        let physical = Arc::new(Mutex::new(physical));

        let broadcast = open_socket(device, self.model.broadcast_id, response_id)?;
        let broadcast = Arc::new(Mutex::new(broadcast));

        self.model
            .link()
            .register_isotp(Arc::new(IsoTpTx(physical.clone())));

        let simulator = Arc::new(self);
        let mut handles = Vec::new();

        handles.push(session::spawn_expiry_task(
            simulator.timer.clone(),
            simulator.model.clone(),
            running.clone(),
        ));

        for rx in [physical.clone(), broadcast] {
            let sim = simulator.clone();
            let tx = physical.clone();
            let running = running.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                receive_loop(sim, rx, tx, running)
            }));
        }

        Ok(handles)
    }

    /// Compute the response for one received UDS request. `None` means no
    /// bytes go on the wire.
    pub fn handle_request(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.is_empty() {
            return None;
        }

        if let Some(bound) = self.model.raw_tree().matches(request) {
            let response = self.model.evaluate(bound, request)?;
            self.timer.touch();
            if response.trim().is_empty() {
                // A matched empty response suppresses the answer entirely.
                return None;
            }
            return Some(hex::literal_hex_to_bytes(&response));
        }

        match request[0] {
            service_id::READ_DATA_BY_IDENTIFIER => {
                let response = self.read_data_by_identifier(request);
                self.timer.touch();
                Some(response)
            }
            service_id::DIAGNOSTIC_SESSION_CONTROL => Some(self.diagnostic_session_control(request)),
            service_id::SECURITY_ACCESS => Some(self.security_access(request)),
            service => Some(negative_response(service)),
        }
    }

    fn read_data_by_identifier(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 {
            return negative_response(service_id::READ_DATA_BY_IDENTIFIER);
        }
        let did = u16::from_be_bytes([request[1], request[2]]);
        match self.model.data_by_identifier(did) {
            Some(data) => {
                let mut response = Vec::with_capacity(3 + data.len());
                response.push(service_id::READ_DATA_BY_IDENTIFIER + 0x40);
                response.push(request[1]);
                response.push(request[2]);
                response.extend_from_slice(data.as_bytes());
                response
            }
            None => negative_response(service_id::READ_DATA_BY_IDENTIFIER),
        }
    }

    fn diagnostic_session_control(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 2 {
            return negative_response(service_id::DIAGNOSTIC_SESSION_CONTROL);
        }
        let session_id = request[1];
        match UdsSession::from_raw(session_id) {
            Some(UdsSession::Default) => {
                self.model.set_session(UdsSession::Default);
                self.timer.disarm();
            }
            Some(session) => {
                self.model.set_session(session);
                self.timer.arm();
            }
            None => warn!(
                ecu = self.model.ident(),
                session = session_id,
                "unknown diagnostic session id"
            ),
        }
        vec![service_id::DIAGNOSTIC_SESSION_CONTROL + 0x40, session_id]
    }

    /// Security-access handshake: a scripted seed answers `[0x27, sub,
    /// seed…]` and arms the progression; the follow-up sub-function one
    /// above the seeded one answers `[0x67]`.
    fn security_access(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 2 {
            return negative_response(service_id::SECURITY_ACCESS);
        }
        let sub = request[1];

        if let Some(seed) = self.model.seed(sub) {
            let mut response = vec![service_id::SECURITY_ACCESS, sub];
            response.extend_from_slice(&hex::literal_hex_to_bytes(&seed));
            self.model.set_security_next(sub.wrapping_add(1));
            return response;
        }

        if sub == self.model.security_next() {
            self.model.set_security_next(0);
            return vec![service_id::SECURITY_ACCESS + 0x40];
        }

        negative_response(service_id::SECURITY_ACCESS)
    }
}

fn receive_loop(
    simulator: Arc<UdsSimulator>,
    rx: Arc<Mutex<IsoTpSocket>>,
    tx: Arc<Mutex<IsoTpSocket>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let mut guard = rx.lock();
        match guard.read() {
            Ok(data) if !data.is_empty() => {
                let request = data.to_vec();
                drop(guard);
                debug!(ecu = simulator.model.ident(), request = ?request, "received UDS request");
                if let Some(response) = simulator.handle_request(&request) {
                    debug!(ecu = simulator.model.ident(), response = ?response, "sending UDS response");
                    if let Err(err) = tx.lock().write(&response) {
                        error!(?err, "failed to send UDS response");
                    }
                }
            }
            Ok(_) => {
                drop(guard);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                drop(guard);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                drop(guard);
                error!(?err, "ISO-TP read error");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!(ecu = simulator.model.ident(), "UDS receive loop stopped");
}

fn open_socket(device: &str, rx_id: u32, tx_id: u32) -> Result<IsoTpSocket, SimulatorError> {
    let socket = IsoTpSocket::open(device, isotp_id(rx_id)?, isotp_id(tx_id)?)
        .map_err(|err| SimulatorError::Transport(format!("failed to open ISO-TP socket: {err}")))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn isotp_id(raw: u32) -> Result<Id, SimulatorError> {
    let id = if raw <= 0x7FF {
        StandardId::new(raw as u16).map(Id::Standard)
    } else {
        ExtendedId::new(raw).map(Id::Extended)
    };
    id.ok_or_else(|| SimulatorError::InvalidConfig(format!("invalid CAN id 0x{raw:X}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: &str = r#"
        Main = {
            RequestId = 0x100,
            ResponseId = 0x200,
            ReadDataByIdentifier = {
                ["F1 91"] = "SN-001",
            },
            Extended = {
                ReadDataByIdentifier = {
                    ["F1 91"] = "SN-EXT",
                },
            },
            Seed = {
                [1] = "11 22 33 44",
            },
            Raw = {
                ["22 F1 90"] = "62 F1 90 01",
                ["3E XX"] = function(request) return "7E " .. getCounterByte(request) end,
                ["10 60"] = "",
            },
        }
    "#;

    fn simulator() -> UdsSimulator {
        UdsSimulator::new(Arc::new(EcuModel::from_chunk("pcm", CHUNK).unwrap()))
    }

    #[test]
    fn raw_literal_wins_over_builtin_services() {
        let sim = simulator();
        assert_eq!(
            sim.handle_request(&[0x22, 0xF1, 0x90]),
            Some(vec![0x62, 0xF1, 0x90, 0x01])
        );
    }

    #[test]
    fn raw_callable_sees_the_request_bytes() {
        let sim = simulator();
        assert_eq!(sim.handle_request(&[0x3E, 0x05]), Some(vec![0x7E, 0x05]));
    }

    #[test]
    fn matched_empty_response_sends_nothing() {
        let sim = simulator();
        assert_eq!(sim.handle_request(&[0x10, 0x60]), None);
        // No fallthrough to session control either.
        assert_eq!(sim.model.session(), UdsSession::Default as u8);
    }

    #[test]
    fn session_control_then_unresolved_did() {
        let sim = simulator();
        assert_eq!(sim.handle_request(&[0x10, 0x02]), Some(vec![0x50, 0x02]));
        assert_eq!(sim.model.session(), UdsSession::Programming as u8);
        // Programming session has no DID table, so the DID misses.
        assert_eq!(
            sim.handle_request(&[0x22, 0xDE, 0xAD]),
            Some(vec![0x7F, 0x22, 0x11])
        );
    }

    #[test]
    fn did_lookup_follows_the_session() {
        let sim = simulator();
        assert_eq!(
            sim.handle_request(&[0x22, 0xF1, 0x91]),
            Some(b"\x62\xF1\x91SN-001".to_vec())
        );
        assert_eq!(sim.handle_request(&[0x10, 0x03]), Some(vec![0x50, 0x03]));
        assert_eq!(
            sim.handle_request(&[0x22, 0xF1, 0x91]),
            Some(b"\x62\xF1\x91SN-EXT".to_vec())
        );
    }

    #[test]
    fn unknown_session_id_echoes_without_state_change() {
        let sim = simulator();
        assert_eq!(sim.handle_request(&[0x10, 0x7E]), Some(vec![0x50, 0x7E]));
        assert_eq!(sim.model.session(), UdsSession::Default as u8);
    }

    #[test]
    fn security_access_handshake() {
        let sim = simulator();
        // Seed request.
        assert_eq!(
            sim.handle_request(&[0x27, 0x01]),
            Some(vec![0x27, 0x01, 0x11, 0x22, 0x33, 0x44])
        );
        // Key for the following sub-function succeeds once.
        assert_eq!(sim.handle_request(&[0x27, 0x02]), Some(vec![0x67]));
        assert_eq!(
            sim.handle_request(&[0x27, 0x02]),
            Some(vec![0x7F, 0x27, 0x11])
        );
    }

    #[test]
    fn out_of_sequence_security_access_is_rejected() {
        let sim = simulator();
        assert_eq!(
            sim.handle_request(&[0x27, 0x04]),
            Some(vec![0x7F, 0x27, 0x11])
        );
    }

    #[test]
    fn unsupported_service_answers_nrc_11() {
        let sim = simulator();
        assert_eq!(
            sim.handle_request(&[0x11, 0x01]),
            Some(vec![0x7F, 0x11, 0x11])
        );
    }

    #[test]
    fn empty_request_is_ignored() {
        let sim = simulator();
        assert_eq!(sim.handle_request(&[]), None);
    }
}
