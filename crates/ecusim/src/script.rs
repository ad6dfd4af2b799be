//! Behavior script binding
//!
//! Every simulated ECU is described by a Lua script. [`EcuScript`] wraps the
//! embedded Lua state behind a mutex (the runtime is not thread-safe; the
//! receive threads and the periodic senders all call into it) and exposes
//! the narrow surface the dispatchers need: attribute lookup, table-entry
//! enumeration, callable invocation and per-PGN payload evaluation.
//!
//! A set of helper functions is injected into the script environment before
//! the chunk runs, so response functions can call `ascii`, `toByteResponse`,
//! `sendRaw` and friends. Helpers that touch ECU state capture the shared
//! [`EcuLink`] rather than the owning model, which keeps the
//! script-to-core callback surface free of ownership cycles.

use std::sync::Arc;
use std::time::Duration;

use mlua::{Function, Lua, Table, Value};
use parking_lot::Mutex;
use tracing::warn;

use crate::hex;
use crate::model::EcuLink;

/// Name of the per-script ECU table.
pub const ECU_TABLE: &str = "Main";

pub const REQUEST_ID_FIELD: &str = "RequestId";
pub const RESPONSE_ID_FIELD: &str = "ResponseId";
pub const BROADCAST_ID_FIELD: &str = "BroadcastId";
pub const J1939_SOURCE_ADDRESS_FIELD: &str = "J1939SourceAddress";
pub const DOIP_LOGICAL_ECU_ADDRESS_FIELD: &str = "DoIPLogicalEcuAddress";

const READ_DATA_BY_IDENTIFIER_TABLE: &str = "ReadDataByIdentifier";
const SEED_TABLE: &str = "Seed";
const PGN_PAYLOAD_FIELD: &str = "payload";
const PGN_CYCLE_TIME_FIELD: &str = "cycleTime";

/// Response tables a pattern key can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTable {
    Raw,
    Pgns,
}

impl ResponseTable {
    pub fn field(self) -> &'static str {
        match self {
            ResponseTable::Raw => "Raw",
            ResponseTable::Pgns => "PGNs",
        }
    }
}

/// A response bound to a pattern leaf: either a literal string, parsed at
/// match time, or a callable identified by its table and raw key and
/// re-resolved under the script mutex at invocation time.
#[derive(Debug, Clone)]
pub enum Bound {
    Literal(String),
    Callable(ResponseTable, String),
}

/// Payload and cycle time of a non-payload-matched PGN entry.
#[derive(Debug, Clone, Default)]
pub struct PgnData {
    pub payload: String,
    pub cycle_time: u64,
}

/// Mutex-guarded binding to one ECU's Lua script.
pub struct EcuScript {
    lua: Mutex<Lua>,
}

impl EcuScript {
    /// Load a script chunk, injecting the helper functions first so the
    /// chunk can already use them in literal table values.
    pub fn load_chunk(name: &str, chunk: &str, link: Arc<EcuLink>) -> mlua::Result<Self> {
        let lua = Lua::new();
        install_helpers(&lua, link)?;
        lua.load(chunk).set_name(name).exec()?;
        Ok(Self {
            lua: Mutex::new(lua),
        })
    }

    fn with_ecu_table<R>(&self, f: impl FnOnce(&Lua, Table) -> mlua::Result<R>) -> mlua::Result<R> {
        let lua = self.lua.lock();
        let table: Table = lua.globals().get(ECU_TABLE)?;
        f(&lua, table)
    }

    /// Whether the script defines the ECU table at all.
    pub fn has_ecu_table(&self) -> bool {
        self.with_ecu_table(|_, _| Ok(())).is_ok()
    }

    /// Numeric attribute of the ECU table, if present.
    pub fn attr_u32(&self, field: &str) -> Option<u32> {
        self.with_ecu_table(|_, table| table.get::<Option<u32>>(field))
            .ok()
            .flatten()
    }

    /// String attribute of the ECU table; absent and empty collapse to `None`.
    pub fn attr_string(&self, field: &str) -> Option<String> {
        let value = self
            .with_ecu_table(|_, table| table.get::<Value>(field))
            .ok()?;
        let text = value_to_string(&value);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// All keys of a response table together with their binding kind.
    pub fn table_entries(&self, table: ResponseTable) -> Vec<(String, Bound)> {
        let result = self.with_ecu_table(|_, ecu| {
            let sub = match ecu.get::<Option<Table>>(table.field())? {
                Some(sub) => sub,
                None => return Ok(Vec::new()),
            };
            let mut entries = Vec::new();
            for pair in sub.pairs::<Value, Value>() {
                let (key, value) = pair?;
                let key = value_to_string(&key);
                if key.is_empty() {
                    continue;
                }
                let bound = match value {
                    Value::Function(_) => Bound::Callable(table, key.clone()),
                    other => Bound::Literal(value_to_string(&other)),
                };
                entries.push((key, bound));
            }
            Ok(entries)
        });
        match result {
            Ok(entries) => entries,
            Err(err) => {
                warn!(table = table.field(), error = %err, "failed to enumerate script table");
                Vec::new()
            }
        }
    }

    /// Invoke a callable table entry with an optional string argument.
    pub fn invoke(
        &self,
        table: ResponseTable,
        key: &str,
        arg: Option<&str>,
    ) -> mlua::Result<String> {
        self.with_ecu_table(|_, ecu| {
            let sub: Table = ecu.get(table.field())?;
            let func: Function = sub.get(key)?;
            let value = match arg {
                Some(arg) => func.call::<Value>(arg)?,
                None => func.call::<Value>(())?,
            };
            Ok(value_to_string(&value))
        })
    }

    /// `ReadDataByIdentifier` lookup; `session` selects the nested
    /// `Programming`/`Extended` sub-table. Function values are invoked with
    /// the identifier; empty results collapse to `None`.
    pub fn data_by_identifier(&self, identifier: &str, session: Option<&str>) -> Option<String> {
        let result = self.with_ecu_table(|_, ecu| {
            let table = match session {
                Some(name) => match ecu.get::<Option<Table>>(name)? {
                    Some(session_table) => {
                        match session_table.get::<Option<Table>>(READ_DATA_BY_IDENTIFIER_TABLE)? {
                            Some(table) => table,
                            None => return Ok(None),
                        }
                    }
                    None => return Ok(None),
                },
                None => match ecu.get::<Option<Table>>(READ_DATA_BY_IDENTIFIER_TABLE)? {
                    Some(table) => table,
                    None => return Ok(None),
                },
            };
            match table.get::<Value>(identifier)? {
                Value::Function(func) => Ok(Some(value_to_string(&func.call::<Value>(identifier)?))),
                other => Ok(Some(value_to_string(&other))),
            }
        });
        match result {
            Ok(Some(data)) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(err) => {
                warn!(identifier, error = %err, "ReadDataByIdentifier lookup failed");
                None
            }
        }
    }

    /// Seed string for a security-access level, if defined and nonempty.
    pub fn seed(&self, level: u8) -> Option<String> {
        let result = self.with_ecu_table(|_, ecu| {
            let seeds = match ecu.get::<Option<Table>>(SEED_TABLE)? {
                Some(seeds) => seeds,
                None => return Ok(None),
            };
            Ok(Some(value_to_string(&seeds.get::<Value>(level as i64)?)))
        });
        match result {
            Ok(Some(seed)) if !seed.is_empty() => Some(seed),
            Ok(_) => None,
            Err(err) => {
                warn!(level, error = %err, "seed lookup failed");
                None
            }
        }
    }

    /// Current payload and cycle time of a non-payload-matched PGN entry.
    ///
    /// The entry may be a plain value, a function (invoked without
    /// arguments) or a table carrying `payload` and `cycleTime`, where the
    /// payload itself may again be a function.
    pub fn pgn_data(&self, key: &str) -> Option<PgnData> {
        let result = self.with_ecu_table(|_, ecu| {
            let pgns = match ecu.get::<Option<Table>>(ResponseTable::Pgns.field())? {
                Some(pgns) => pgns,
                None => return Ok(None),
            };
            let mut data = PgnData::default();
            match pgns.get::<Value>(key)? {
                Value::Nil => return Ok(None),
                Value::Function(func) => data.payload = value_to_string(&func.call::<Value>(())?),
                Value::Table(entry) => {
                    if let Some(cycle) = entry.get::<Option<u64>>(PGN_CYCLE_TIME_FIELD)? {
                        data.cycle_time = cycle;
                    }
                    match entry.get::<Value>(PGN_PAYLOAD_FIELD)? {
                        Value::Nil => {}
                        Value::Function(func) => {
                            data.payload = value_to_string(&func.call::<Value>(())?)
                        }
                        other => data.payload = value_to_string(&other),
                    }
                }
                other => data.payload = value_to_string(&other),
            }
            Ok(Some(data))
        });
        match result {
            Ok(data) => data,
            Err(err) => {
                warn!(key, error = %err, "PGN evaluation failed");
                None
            }
        }
    }
}

/// Render a Lua value the way scripts expect responses to be read:
/// strings verbatim, numbers in decimal, everything else empty.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(int) => int.to_string(),
        Value::Number(num) => {
            if num.fract() == 0.0 {
                format!("{}", *num as i64)
            } else {
                num.to_string()
            }
        }
        Value::String(text) => text.to_string_lossy().to_string(),
        _ => String::new(),
    }
}

/// Inject the helper functions scripts can call back into.
fn install_helpers(lua: &Lua, link: Arc<EcuLink>) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set(
        "ascii",
        lua.create_function(|_, text: String| Ok(hex::ascii(&text)))?,
    )?;

    globals.set(
        "toByteResponse",
        lua.create_function(|_, (value, len): (u32, Option<u32>)| {
            Ok(hex::to_byte_response(value, len.unwrap_or(4) as usize))
        })?,
    )?;

    globals.set(
        "getCounterByte",
        lua.create_function(|_, msg: String| Ok(hex::counter_byte(&msg)))?,
    )?;

    let l = link.clone();
    globals.set(
        "getDataBytes",
        lua.create_function(move |_, msg: String| {
            l.append_data_bytes(&msg);
            Ok(())
        })?,
    )?;

    let l = link.clone();
    globals.set(
        "createHash",
        lua.create_function(move |_, ()| Ok(l.create_hash()))?,
    )?;

    globals.set(
        "sleep",
        lua.create_function(|_, ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(())
        })?,
    )?;

    let l = link.clone();
    globals.set(
        "getCurrentSession",
        lua.create_function(move |_, ()| Ok(l.session() as u32))?,
    )?;

    let l = link.clone();
    globals.set(
        "switchToSession",
        lua.create_function(move |_, session: u32| {
            l.set_session(session as u8);
            Ok(())
        })?,
    )?;

    let l = link.clone();
    globals.set(
        "sendRaw",
        lua.create_function(move |_, msg: String| {
            l.send_raw_hex(&msg);
            Ok(())
        })?,
    )?;

    let l = link.clone();
    globals.set(
        "disconnectDoip",
        lua.create_function(move |_, ()| {
            l.disconnect_doip();
            Ok(())
        })?,
    )?;

    globals.set(
        "sendDoipVehicleAnnouncements",
        lua.create_function(move |_, ()| {
            link.send_doip_announcements();
            Ok(())
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(chunk: &str) -> EcuScript {
        EcuScript::load_chunk("test", chunk, EcuLink::new()).unwrap()
    }

    #[test]
    fn attributes_are_read_from_the_ecu_table() {
        let script = script(
            r#"
            Main = {
                RequestId = 0x100,
                ResponseId = 0x200,
                J1939SourceAddress = 0x4A,
            }
            "#,
        );
        assert_eq!(script.attr_u32(REQUEST_ID_FIELD), Some(0x100));
        assert_eq!(script.attr_u32(RESPONSE_ID_FIELD), Some(0x200));
        assert_eq!(script.attr_u32(J1939_SOURCE_ADDRESS_FIELD), Some(0x4A));
        assert_eq!(script.attr_u32(BROADCAST_ID_FIELD), None);
    }

    #[test]
    fn table_entries_distinguish_literals_and_callables() {
        let script = script(
            r#"
            Main = {
                Raw = {
                    ["22 F1 90"] = "62 F1 90 01",
                    ["3E XX"] = function(request) return "7E 00" end,
                },
            }
            "#,
        );
        let mut entries = script.table_entries(ResponseTable::Raw);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].1, Bound::Literal(ref s) if s == "62 F1 90 01"));
        assert!(matches!(entries[1].1, Bound::Callable(ResponseTable::Raw, _)));
    }

    #[test]
    fn helpers_are_usable_in_literal_values() {
        let script = script(
            r#"
            Main = {
                Raw = {
                    ["22 F1 90"] = "62 F1 90" .. ascii("AB"),
                },
            }
            "#,
        );
        let entries = script.table_entries(ResponseTable::Raw);
        assert!(matches!(entries[0].1, Bound::Literal(ref s) if s == "62 F1 90 41 42 "));
    }

    #[test]
    fn invoke_passes_the_request_string() {
        let script = script(
            r#"
            Main = {
                Raw = {
                    ["3E XX"] = function(request) return "7E " .. getCounterByte(request) end,
                },
            }
            "#,
        );
        let result = script
            .invoke(ResponseTable::Raw, "3E XX", Some("3E 05"))
            .unwrap();
        assert_eq!(result, "7E 05");
    }

    #[test]
    fn data_by_identifier_respects_session_tables() {
        let script = script(
            r#"
            Main = {
                ReadDataByIdentifier = {
                    ["F1 90"] = "SALGA2EV9HA298784",
                },
                Extended = {
                    ReadDataByIdentifier = {
                        ["F1 90"] = "EXTENDED",
                    },
                },
            }
            "#,
        );
        assert_eq!(
            script.data_by_identifier("F1 90", None).as_deref(),
            Some("SALGA2EV9HA298784")
        );
        assert_eq!(
            script.data_by_identifier("F1 90", Some("Extended")).as_deref(),
            Some("EXTENDED")
        );
        // Programming has no table at all, so the lookup misses.
        assert_eq!(script.data_by_identifier("F1 90", Some("Programming")), None);
        assert_eq!(script.data_by_identifier("F1 99", None), None);
    }

    #[test]
    fn seed_lookup_uses_numeric_levels() {
        let script = script(
            r#"
            Main = {
                Seed = {
                    [1] = "11 22 33 44",
                },
            }
            "#,
        );
        assert_eq!(script.seed(1).as_deref(), Some("11 22 33 44"));
        assert_eq!(script.seed(3), None);
    }

    #[test]
    fn pgn_data_handles_value_function_and_table_entries() {
        let script = script(
            r#"
            Main = {
                PGNs = {
                    ["FE EE 00"] = "01 02 03 04 05 06 07 08",
                    ["FE F1 00"] = { payload = "11 22", cycleTime = 100 },
                    ["FE F2 00"] = function() return "AA BB" end,
                },
            }
            "#,
        );
        let plain = script.pgn_data("FE EE 00").unwrap();
        assert_eq!(plain.payload, "01 02 03 04 05 06 07 08");
        assert_eq!(plain.cycle_time, 0);

        let cyclic = script.pgn_data("FE F1 00").unwrap();
        assert_eq!(cyclic.payload, "11 22");
        assert_eq!(cyclic.cycle_time, 100);

        let dynamic = script.pgn_data("FE F2 00").unwrap();
        assert_eq!(dynamic.payload, "AA BB");

        assert!(script.pgn_data("FE FF 00").is_none());
    }
}
