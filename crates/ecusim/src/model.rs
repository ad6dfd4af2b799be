//! Per-ECU behavior model
//!
//! [`EcuModel`] is built once per simulation script: it caches the wire
//! identifiers, builds the pattern trees from the `Raw` and `PGNs` tables
//! and keeps the security-access progression. [`EcuLink`] carries the state
//! the injected script helpers touch — the current diagnostic session, the
//! received-data accumulator and the registered outbound ports. The helpers
//! hold the link through an `Arc`, so the script never owns the model that
//! owns it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_16_IBM_3740};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::SimulatorError;
use crate::hex;
use crate::j1939::parse_pgn_key;
use crate::pattern::{PatternError, PatternTree};
use crate::script::{
    Bound, EcuScript, PgnData, ResponseTable, BROADCAST_ID_FIELD, DOIP_LOGICAL_ECU_ADDRESS_FIELD,
    ECU_TABLE, J1939_SOURCE_ADDRESS_FIELD, REQUEST_ID_FIELD, RESPONSE_ID_FIELD,
};

/// UDS functional broadcast address used when the script defines none.
pub const DEFAULT_BROADCAST_ID: u32 = 0x7DF;

/// CRC-CCITT with seed 0xFFFF, as used by `createHash`.
const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// UDS diagnostic sessions the simulator models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdsSession {
    Default = 0x01,
    Programming = 0x02,
    Extended = 0x03,
}

impl UdsSession {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(UdsSession::Default),
            0x02 => Some(UdsSession::Programming),
            0x03 => Some(UdsSession::Extended),
            _ => None,
        }
    }

    /// Name of the session-scoped sub-table inside the ECU table, if any.
    pub fn table_name(self) -> Option<&'static str> {
        match self {
            UdsSession::Default => None,
            UdsSession::Programming => Some("Programming"),
            UdsSession::Extended => Some("Extended"),
        }
    }
}

/// Outbound diagnostic port a script's `sendRaw` broadcasts through.
pub trait DiagnosticTx: Send + Sync {
    fn send(&self, data: &[u8]);
}

/// Control surface of the DoIP server as seen from scripts.
pub trait DoipPort: Send + Sync {
    fn send_diagnostic(&self, source: u16, data: Vec<u8>);
    fn disconnect(&self);
    fn send_announcements(&self);
}

/// State shared between the dispatchers and the injected script helpers.
///
/// Session reads may come from periodic-sender threads via
/// `getCurrentSession`, so the session is an atomic.
pub struct EcuLink {
    session: AtomicU8,
    received_data: Mutex<String>,
    isotp: RwLock<Option<Arc<dyn DiagnosticTx>>>,
    doip: RwLock<Option<Arc<dyn DoipPort>>>,
    doip_source: AtomicU16,
}

impl EcuLink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: AtomicU8::new(UdsSession::Default as u8),
            received_data: Mutex::new(String::new()),
            isotp: RwLock::new(None),
            doip: RwLock::new(None),
            doip_source: AtomicU16::new(0),
        })
    }

    pub fn session(&self) -> u8 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn set_session(&self, session: u8) {
        self.session.store(session, Ordering::SeqCst);
    }

    /// Append the data portion of a transfer message (everything past the
    /// first two bytes of the whitespace-stripped hex string) to the
    /// accumulator consumed by [`Self::create_hash`].
    pub fn append_data_bytes(&self, msg: &str) {
        let stripped = hex::strip_whitespace(msg);
        let tail = stripped.get(4..).unwrap_or("");
        self.received_data.lock().push_str(tail);
    }

    /// CRC-CCITT (seed 0xFFFF) over the accumulated bytes, rendered as
    /// uppercase hex and zero-padded to an even number of characters. The
    /// accumulator is cleared; an empty accumulator hashes to `"0000"`.
    pub fn create_hash(&self) -> String {
        let mut accumulator = self.received_data.lock();
        if accumulator.is_empty() {
            return "0000".to_string();
        }
        let bytes = hex::literal_hex_to_bytes(&accumulator);
        accumulator.clear();
        let mut rendered = format!("{:X}", CRC_CCITT.checksum(&bytes));
        if rendered.len() % 2 != 0 {
            rendered.insert(0, '0');
        }
        rendered
    }

    /// Send a literal hex string on every registered front.
    pub fn send_raw_hex(&self, msg: &str) {
        let bytes = hex::literal_hex_to_bytes(msg);
        if bytes.is_empty() {
            return;
        }
        if let Some(tx) = self.isotp.read().as_ref() {
            tx.send(&bytes);
        }
        if let Some(port) = self.doip.read().as_ref() {
            port.send_diagnostic(self.doip_source.load(Ordering::SeqCst), bytes);
        }
    }

    pub fn disconnect_doip(&self) {
        if let Some(port) = self.doip.read().as_ref() {
            port.disconnect();
        }
    }

    pub fn send_doip_announcements(&self) {
        if let Some(port) = self.doip.read().as_ref() {
            port.send_announcements();
        }
    }

    pub fn register_isotp(&self, tx: Arc<dyn DiagnosticTx>) {
        *self.isotp.write() = Some(tx);
    }

    pub fn register_doip(&self, port: Arc<dyn DoipPort>, source: u16) {
        self.doip_source.store(source, Ordering::SeqCst);
        *self.doip.write() = Some(port);
    }
}

/// One simulated ECU, built from a behavior script.
pub struct EcuModel {
    ident: String,
    script: EcuScript,
    link: Arc<EcuLink>,
    pub request_id: Option<u32>,
    pub response_id: Option<u32>,
    pub broadcast_id: u32,
    pub j1939_source_address: Option<u8>,
    pub doip_logical_address: Option<u16>,
    raw_tree: PatternTree<Bound>,
    pgn_tree: PatternTree<Bound>,
    pgn_map: HashMap<u32, String>,
    security_next: AtomicU8,
}

impl EcuModel {
    /// Load a simulation script from disk. The file stem becomes the ECU's
    /// display identifier.
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let chunk = std::fs::read_to_string(path)?;
        let ident = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_chunk(&ident, &chunk)
    }

    /// Build a model from an in-memory script chunk.
    pub fn from_chunk(ident: &str, chunk: &str) -> Result<Self, SimulatorError> {
        let link = EcuLink::new();
        let script = EcuScript::load_chunk(ident, chunk, link.clone())?;
        if !script.has_ecu_table() {
            return Err(SimulatorError::InvalidConfig(format!(
                "script '{ident}' defines no '{ECU_TABLE}' table"
            )));
        }

        let doip_logical_address = script
            .attr_u32(DOIP_LOGICAL_ECU_ADDRESS_FIELD)
            .map(|addr| addr as u16);
        if let Some(address) = doip_logical_address {
            link.register_doip_source(address);
        }

        let raw_tree = build_tree(&script, ResponseTable::Raw, |_| true)?;
        let pgn_tree = build_tree(&script, ResponseTable::Pgns, |key| key.contains('#'))?;

        let mut pgn_map = HashMap::new();
        for (key, _) in script.table_entries(ResponseTable::Pgns) {
            if key.contains('#') {
                continue;
            }
            let pgn = parse_pgn_key(&key);
            if pgn == 0 {
                warn!(ecu = ident, key = %key, "ignoring unparsable PGN key");
                continue;
            }
            pgn_map.insert(pgn, key);
        }

        debug!(
            ecu = ident,
            raw = raw_tree.len(),
            pgn = pgn_tree.len(),
            cyclic = pgn_map.len(),
            "simulation tables indexed"
        );

        Ok(Self {
            ident: ident.to_string(),
            request_id: script.attr_u32(REQUEST_ID_FIELD),
            response_id: script.attr_u32(RESPONSE_ID_FIELD),
            broadcast_id: script
                .attr_u32(BROADCAST_ID_FIELD)
                .unwrap_or(DEFAULT_BROADCAST_ID),
            j1939_source_address: script
                .attr_u32(J1939_SOURCE_ADDRESS_FIELD)
                .map(|addr| addr as u8),
            doip_logical_address,
            raw_tree,
            pgn_tree,
            pgn_map,
            security_next: AtomicU8::new(0),
            script,
            link,
        })
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn script(&self) -> &EcuScript {
        &self.script
    }

    pub fn link(&self) -> &Arc<EcuLink> {
        &self.link
    }

    pub fn raw_tree(&self) -> &PatternTree<Bound> {
        &self.raw_tree
    }

    pub fn pgn_tree(&self) -> &PatternTree<Bound> {
        &self.pgn_tree
    }

    /// Non-payload-matched PGNs: cyclic senders and 0xEA00 request targets.
    pub fn pgn_map(&self) -> &HashMap<u32, String> {
        &self.pgn_map
    }

    pub fn session(&self) -> u8 {
        self.link.session()
    }

    pub fn set_session(&self, session: UdsSession) {
        self.link.set_session(session as u8);
    }

    pub fn security_next(&self) -> u8 {
        self.security_next.load(Ordering::SeqCst)
    }

    pub fn set_security_next(&self, value: u8) {
        self.security_next.store(value, Ordering::SeqCst);
    }

    /// Evaluate a matched response. Callables receive the raw request as a
    /// space-separated hex string and run under the script mutex; a script
    /// error is logged and swallowed (the request stays unanswered).
    pub fn evaluate(&self, bound: &Bound, request: &[u8]) -> Option<String> {
        match bound {
            Bound::Literal(text) => Some(text.clone()),
            Bound::Callable(table, key) => {
                match self
                    .script
                    .invoke(*table, key, Some(&hex::hex_string(request)))
                {
                    Ok(text) => Some(text),
                    Err(err) => {
                        warn!(ecu = %self.ident, key = %key, error = %err, "script handler failed");
                        None
                    }
                }
            }
        }
    }

    /// `ReadDataByIdentifier` lookup keyed by the two-byte DID rendering,
    /// scoped to the current session's sub-table when not in the default
    /// session.
    pub fn data_by_identifier(&self, did: u16) -> Option<String> {
        let key = hex::to_byte_response(did as u32, 2);
        let session = UdsSession::from_raw(self.session()).and_then(UdsSession::table_name);
        self.script.data_by_identifier(&key, session)
    }

    pub fn seed(&self, level: u8) -> Option<String> {
        self.script.seed(level)
    }

    pub fn pgn_data(&self, key: &str) -> Option<PgnData> {
        self.script.pgn_data(key)
    }

    pub fn pgn_data_by_number(&self, pgn: u32) -> Option<PgnData> {
        let key = self.pgn_map.get(&pgn)?;
        self.script.pgn_data(key)
    }
}

impl EcuLink {
    /// Remember the ECU's DoIP logical address before the server front is
    /// up, so `sendRaw` uses the right source once a port registers.
    fn register_doip_source(&self, source: u16) {
        self.doip_source.store(source, Ordering::SeqCst);
    }
}

fn build_tree(
    script: &EcuScript,
    table: ResponseTable,
    filter: impl Fn(&str) -> bool,
) -> Result<PatternTree<Bound>, SimulatorError> {
    let mut tree = PatternTree::new();
    for (key, bound) in script.table_entries(table) {
        if !filter(&key) {
            continue;
        }
        match tree.insert(&key, bound) {
            Ok(()) => {}
            Err(err @ PatternError::InvalidPattern { .. }) => {
                warn!(table = table.field(), key = %key, error = %err, "ignoring invalid request key");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(tree)
}
