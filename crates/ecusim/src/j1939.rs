//! SAE J1939 front
//!
//! Receives parameter group requests on a kernel J1939 datagram socket
//! bound to the ECU's source address, matches them against the
//! payload-keyed PGN tree and answers according to the script. PGNs without
//! a payload pattern are served on request (PGN 0xEA00) and, when they
//! define a cycle time, sent periodically by one sender thread each.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socketcan::nl::{CanInterface, CanState};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SimulatorError;
use crate::hex;
use crate::model::EcuModel;

/// PGN of the J1939 request message (PGN 59904).
pub const PGN_REQUEST: u32 = 0xEA00;
/// PGN of the J1939 acknowledgement message (PGN 59392).
pub const PGN_ACKNOWLEDGMENT: u32 = 0xE800;
/// Global destination address.
const GLOBAL_ADDRESS: u8 = 0xFF;

/// 255 transport-protocol frames of 7 bytes plus the 3 PGN bytes.
const MAX_PACKET: usize = 1788;

const SEND_RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Thin wrapper around a kernel `CAN_J1939` datagram socket.
pub struct J1939Socket {
    fd: RawFd,
}

impl J1939Socket {
    /// Open a broadcast-capable socket bound to `source_address` on
    /// `device`, receiving all PGNs.
    pub fn open(device: &str, source_address: u8) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_DGRAM, libc::CAN_J1939) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Self { fd };

        let broadcast: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BROADCAST,
                &broadcast as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let ifindex = interface_index(device)?;
        let addr = sockaddr(ifindex as libc::c_int, libc::J1939_NO_PGN, source_address);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_can as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(socket)
    }

    /// Blocking receive; returns the datagram length, the sender's address
    /// and the PGN it arrived on.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, u8, u32)> {
        let mut addr: libc::sockaddr_can = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t;
        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_can as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        let j1939 = unsafe { addr.can_addr.j1939 };
        Ok((received as usize, j1939.addr, j1939.pgn))
    }

    /// Send `payload` on `pgn` to `destination`.
    pub fn send_to(
        &self,
        pgn: u32,
        destination: u8,
        payload: &[u8],
        nonblocking: bool,
    ) -> io::Result<usize> {
        let addr = sockaddr(0, pgn, destination);
        let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
        let sent = unsafe {
            libc::sendto(
                self.fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                flags,
                &addr as *const libc::sockaddr_can as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    /// Unblock a pending receive, e.g. on shutdown.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }
}

impl Drop for J1939Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn interface_index(device: &str) -> io::Result<libc::c_uint> {
    let name = std::ffi::CString::new(device)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid device name"))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

fn sockaddr(ifindex: libc::c_int, pgn: u32, addr: u8) -> libc::sockaddr_can {
    let mut sa: libc::sockaddr_can = unsafe { std::mem::zeroed() };
    sa.can_family = libc::AF_CAN as libc::sa_family_t;
    sa.can_ifindex = ifindex;
    sa.can_addr = libc::__c_anonymous_sockaddr_can_can_addr {
        j1939: libc::__c_anonymous_sockaddr_can_j1939 {
            name: libc::J1939_NO_NAME,
            pgn,
            addr,
        },
    };
    sa
}

/// One outgoing J1939 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct J1939Reply {
    pub pgn: u32,
    pub destination: u8,
    pub payload: Vec<u8>,
}

pub struct J1939Simulator {
    model: Arc<EcuModel>,
    device: String,
    source_address: u8,
    socket: Arc<J1939Socket>,
    running: Arc<AtomicBool>,
}

impl J1939Simulator {
    pub fn has_simulation(model: &EcuModel) -> bool {
        model.j1939_source_address.is_some()
    }

    pub fn new(
        device: &str,
        model: Arc<EcuModel>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, SimulatorError> {
        let source_address = model
            .j1939_source_address
            .ok_or_else(|| SimulatorError::InvalidConfig("missing J1939SourceAddress".into()))?;
        let socket = J1939Socket::open(device, source_address)
            .map_err(|err| SimulatorError::Transport(format!("failed to open J1939 socket: {err}")))?;
        Ok(Self {
            model,
            device: device.to_string(),
            source_address,
            socket: Arc::new(socket),
            running,
        })
    }

    /// Start the receive thread and one periodic-sender thread per
    /// non-payload-matched PGN.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let model = self.model.clone();
            let socket = self.socket.clone();
            let running = self.running.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                receive_loop(model, socket, running)
            }));
        }

        info!(
            ecu = self.model.ident(),
            count = self.model.pgn_map().len(),
            "starting periodic PGN senders"
        );
        for (&pgn, key) in self.model.pgn_map() {
            let model = self.model.clone();
            let device = self.device.clone();
            let source = self.source_address;
            let key = key.clone();
            let running = self.running.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                periodic_sender(model, device, source, pgn, key, running)
            }));
        }

        handles
    }

    /// Close the receive socket so the blocking receive observes shutdown.
    pub fn stop(&self) {
        self.socket.shutdown();
    }
}

fn receive_loop(model: Arc<EcuModel>, socket: Arc<J1939Socket>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, source, pgn)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                debug!(
                    ecu = model.ident(),
                    source = format!("0x{source:02X}"),
                    pgn = format!("0x{pgn:05X}"),
                    len,
                    "received J1939 message"
                );
                if let Some(reply) = handle_datagram(&model, pgn, source, &buf[..len]) {
                    if let Err(err) =
                        socket.send_to(reply.pgn, reply.destination, &reply.payload, false)
                    {
                        warn!(pgn = reply.pgn, error = %err, "failed to send J1939 response");
                    }
                }
            }
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                error!(ecu = model.ident(), error = %err, "J1939 receive error");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!(ecu = model.ident(), "J1939 receive loop stopped");
}

/// Route one received datagram to its reply, if any.
///
/// The lookup key for the payload-matched tree is the arrival PGN as three
/// little-endian bytes followed by the payload. Unmatched requests arriving
/// on PGN 0xEA00 fall back to the non-payload PGN map, keyed by the PGN
/// encoded in the request payload.
pub fn handle_datagram(
    model: &EcuModel,
    pgn: u32,
    source: u8,
    payload: &[u8],
) -> Option<J1939Reply> {
    let mut lookup = Vec::with_capacity(3 + payload.len());
    lookup.extend_from_slice(&pgn_bytes(pgn));
    lookup.extend_from_slice(payload);

    if let Some(bound) = model.pgn_tree().matches(&lookup) {
        let response = model.evaluate(bound, payload)?;
        if response.is_empty() {
            return None;
        }
        return Some(interpret_reply(&response, source, pgn));
    }

    if pgn == PGN_REQUEST {
        let requested = parse_pgn(&hex::hex_string(payload));
        let data = model.pgn_data_by_number(requested)?;
        if data.payload.is_empty() {
            return None;
        }
        // Requested payloads go out verbatim on the requested PGN; the
        // ACK and redirect forms apply to payload-matched entries only.
        return Some(J1939Reply {
            pgn: requested,
            destination: source,
            payload: hex::literal_hex_to_bytes(&data.payload),
        });
    }

    None
}

/// Turn a script response string into an outgoing message.
///
/// `ACK …` assembles an acknowledgement on PGN 0xE800 to the global
/// address; `pgn # payload` redirects the payload onto another PGN; a plain
/// hex string answers on `pgn` to the originator.
fn interpret_reply(response: &str, origin: u8, pgn: u32) -> J1939Reply {
    if let Some(ack_info) = response.strip_prefix("ACK") {
        return J1939Reply {
            pgn: PGN_ACKNOWLEDGMENT,
            destination: GLOBAL_ADDRESS,
            payload: assemble_ack(ack_info, origin, pgn),
        };
    }
    if let Some(separator) = response.find('#') {
        return J1939Reply {
            pgn: parse_pgn(&response[..separator]),
            destination: origin,
            payload: hex::literal_hex_to_bytes(&response[separator + 1..]),
        };
    }
    J1939Reply {
        pgn,
        destination: origin,
        payload: hex::literal_hex_to_bytes(response),
    }
}

/// Acknowledgement layout per J1939-21 §5.4.4.
fn assemble_ack(info: &str, origin: u8, pgn: u32) -> Vec<u8> {
    let info = hex::literal_hex_to_bytes(info);
    let pgn = pgn_bytes(pgn);
    vec![
        info.first().copied().unwrap_or(0x00), // control byte
        info.get(1).copied().unwrap_or(0x00),  // group function value
        0xFF,                                  // reserved
        0xFF,                                  // reserved
        origin,                                // address acknowledged
        pgn[0],
        pgn[1],
        pgn[2],
    ]
}

fn pgn_bytes(pgn: u32) -> [u8; 3] {
    [
        (pgn & 0xFF) as u8,
        ((pgn >> 8) & 0xFF) as u8,
        ((pgn >> 16) & 0xFF) as u8,
    ]
}

/// Parse a PGN string from a response or a 0xEA00 request payload.
///
/// Fewer than six non-separator characters forming a positive decimal
/// number below 100000 parse as decimal (`"65226"`); everything else
/// parses as up to three little-endian hex bytes (`"EE FE 00"` → 0xFEEE).
/// Five hex digits that also read as decimal are taken as decimal — a
/// documented quirk of the key syntax.
pub fn parse_pgn(text: &str) -> u32 {
    let cleaned = hex::strip_separators(text);
    if cleaned.len() < 6 {
        if let Ok(value) = cleaned.parse::<u32>() {
            if value > 0 && value < 100_000 {
                return value;
            }
        }
    }
    let bytes = hex::literal_hex_to_bytes(&cleaned);
    if bytes.is_empty() || bytes.len() > 3 {
        return 0;
    }
    bytes
        .iter()
        .rev()
        .fold(0u32, |pgn, &byte| (pgn << 8) | byte as u32)
}

/// Parse a non-payload PGN table key.
///
/// Decimal keys read as in [`parse_pgn`]; hex byte keys are written in PGN
/// order `[PF, PS, DP]`, so `"FE EE 00"` names PGN 0xFEEE while the wire
/// encodes the same PGN little-endian.
pub fn parse_pgn_key(text: &str) -> u32 {
    let cleaned = hex::strip_separators(text);
    if cleaned.len() < 6 {
        if let Ok(value) = cleaned.parse::<u32>() {
            if value > 0 && value < 100_000 {
                return value;
            }
        }
    }
    let bytes = hex::literal_hex_to_bytes(&cleaned);
    if bytes.is_empty() || bytes.len() > 3 {
        return 0;
    }
    let pf = bytes[0] as u32;
    let ps = bytes.get(1).copied().unwrap_or(0) as u32;
    let dp = bytes.get(2).copied().unwrap_or(0) as u32;
    (dp << 16) | (pf << 8) | ps
}

/// One iteration per cycle: re-evaluate the script, stop on a zero cycle
/// time, send only while the bus is up, then sleep the cycle time.
fn periodic_sender(
    model: Arc<EcuModel>,
    device: String,
    source: u8,
    pgn: u32,
    key: String,
    running: Arc<AtomicBool>,
) {
    debug!(pgn = format!("0x{pgn:05X}"), key = %key, "periodic PGN sender started");
    loop {
        let Some(data) = model.pgn_data(&key) else {
            break;
        };
        if data.cycle_time == 0 {
            debug!(pgn = format!("0x{pgn:05X}"), "cycle time is 0, sender stops");
            break;
        }

        let payload = hex::literal_hex_to_bytes(&data.payload);
        if !payload.is_empty() && bus_is_active(&device) {
            match J1939Socket::open(&device, source) {
                Ok(socket) => {
                    let mut retries = SEND_RETRIES;
                    while retries > 0 {
                        match socket.send_to(pgn, GLOBAL_ADDRESS, &payload, true) {
                            Ok(_) => break,
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                                retries -= 1;
                                debug!(
                                    pgn = format!("0x{pgn:05X}"),
                                    retries, "send blocked, backing off"
                                );
                                std::thread::sleep(RETRY_BACKOFF);
                            }
                            Err(err) => {
                                warn!(pgn = format!("0x{pgn:05X}"), error = %err, "failed to send periodic PGN");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(device = %device, error = %err, "failed to open periodic send socket")
                }
            }
        }

        std::thread::sleep(Duration::from_millis(data.cycle_time));
        if !running.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(pgn = format!("0x{pgn:05X}"), "periodic PGN sender stopped");
}

/// The link carries traffic only in the error-active and error-warning
/// states; a failed state query counts as inactive (virtual devices report
/// no state at all).
fn bus_is_active(device: &str) -> bool {
    match CanInterface::open(device) {
        Ok(iface) => matches!(
            iface.state(),
            Ok(Some(CanState::ErrorActive | CanState::ErrorWarning))
        ),
        Err(err) => {
            warn!(device, error = ?err, "unable to query CAN state, assuming inactive");
            false
        }
    }
}
