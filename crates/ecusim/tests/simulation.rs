//! End-to-end dispatch tests against a full simulation script.
//!
//! Drives the three fronts through their request→response entry points,
//! the same paths the socket loops call.

use std::sync::Arc;

use ecusim::doip::route_diagnostic;
use ecusim::j1939::{handle_datagram, J1939Reply, PGN_ACKNOWLEDGMENT, PGN_REQUEST};
use ecusim::model::UdsSession;
use ecusim::uds::UdsSimulator;
use ecusim::EcuModel;

const SCRIPT: &str = r#"
    Main = {
        RequestId = 0x100,
        ResponseId = 0x200,
        J1939SourceAddress = 0x4A,
        DoIPLogicalEcuAddress = 0x0201,

        ReadDataByIdentifier = {
            ["F1 90"] = "SALGA2EV9HA298784",
        },

        Programming = {
            ReadDataByIdentifier = {
                ["F1 95"] = "boot-0.9",
            },
        },

        Seed = {
            [1] = "AA BB",
        },

        Raw = {
            ["3E 00"] = "7E 00",
            ["22 F1 86"] = function(request)
                return "62 F1 86 " .. toByteResponse(getCurrentSession(), 1)
            end,
            ["36 XX *"] = function(request)
                getDataBytes(request)
                return "76 " .. getCounterByte(request)
            end,
            ["37"] = function(request)
                return "77 " .. createHash()
            end,
            ["31 01 FF 00"] = function(request)
                switchToSession(2)
                return "71 01 FF 00"
            end,
        },

        PGNs = {
            ["FE EE 00"] = "01 02 03 04 05 06 07 08",
            ["00 EA 00 # 00 EE 00"] = "ACK 00",
        },
    }
"#;

fn model() -> Arc<EcuModel> {
    Arc::new(EcuModel::from_chunk("engine", SCRIPT).unwrap())
}

#[test]
fn uds_raw_and_builtin_services_share_one_model() {
    let model = model();
    let uds = UdsSimulator::new(model.clone());

    // Raw literal.
    assert_eq!(uds.handle_request(&[0x3E, 0x00]), Some(vec![0x7E, 0x00]));

    // Built-in RDBI falls back when the tree misses.
    assert_eq!(
        uds.handle_request(&[0x22, 0xF1, 0x90]),
        Some(b"\x62\xF1\x90SALGA2EV9HA298784".to_vec())
    );

    // A scripted routine switches the session...
    assert_eq!(
        uds.handle_request(&[0x31, 0x01, 0xFF, 0x00]),
        Some(vec![0x71, 0x01, 0xFF, 0x00])
    );
    assert_eq!(model.session(), UdsSession::Programming as u8);

    // ...which the session-scoped DID table observes.
    assert_eq!(
        uds.handle_request(&[0x22, 0xF1, 0x95]),
        Some(b"\x62\xF1\x95boot-0.9".to_vec())
    );

    // And the dynamic response reads the session through the helper.
    assert_eq!(
        uds.handle_request(&[0x22, 0xF1, 0x86]),
        Some(vec![0x62, 0xF1, 0x86, 0x02])
    );
}

#[test]
fn transfer_hash_accumulates_across_requests() {
    let uds = UdsSimulator::new(model());

    // Two transfer blocks carrying the ASCII digits 1..9.
    assert_eq!(
        uds.handle_request(&[0x36, 0x01, 0x31, 0x32, 0x33, 0x34, 0x35]),
        Some(vec![0x76, 0x01])
    );
    assert_eq!(
        uds.handle_request(&[0x36, 0x02, 0x36, 0x37, 0x38, 0x39]),
        Some(vec![0x76, 0x02])
    );

    // CRC-CCITT/0xFFFF over "123456789" is 0x29B1.
    assert_eq!(
        uds.handle_request(&[0x37]),
        Some(vec![0x77, 0x29, 0xB1])
    );

    // The accumulator is cleared by the hash.
    assert_eq!(uds.handle_request(&[0x37]), Some(vec![0x77, 0x00, 0x00]));
}

#[test]
fn security_access_seed_then_key() {
    let uds = UdsSimulator::new(model());
    assert_eq!(
        uds.handle_request(&[0x27, 0x01]),
        Some(vec![0x27, 0x01, 0xAA, 0xBB])
    );
    assert_eq!(uds.handle_request(&[0x27, 0x02]), Some(vec![0x67]));
    assert_eq!(
        uds.handle_request(&[0x27, 0x02]),
        Some(vec![0x7F, 0x27, 0x11])
    );
}

#[test]
fn j1939_request_ack_and_payload_paths() {
    let model = model();

    // Requesting the address-claim PGN is acknowledged on 0xE800.
    let ack = handle_datagram(&model, PGN_REQUEST, 0x21, &[0x00, 0xEE, 0x00]).unwrap();
    assert_eq!(ack.pgn, PGN_ACKNOWLEDGMENT);
    assert_eq!(ack.destination, 0xFF);
    assert_eq!(ack.payload[4], 0x21);

    // Requesting a mapped PGN serves its payload on that PGN.
    let reply = handle_datagram(&model, PGN_REQUEST, 0x21, &[0xEE, 0xFE, 0x00]).unwrap();
    assert_eq!(
        reply,
        J1939Reply {
            pgn: 0xFEEE,
            destination: 0x21,
            payload: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
        }
    );
}

#[test]
fn doip_routes_through_the_same_raw_tree() {
    let ecus = vec![model()];

    let response = route_diagnostic(&ecus, 0x0201, &[0x3E, 0x00]).unwrap();
    assert_eq!(response, vec![0x7E, 0x00]);

    let miss = route_diagnostic(&ecus, 0x0201, &[0x19, 0x02]).unwrap();
    assert_eq!(miss, vec![0x7F, 0x19, 0x11]);

    assert!(route_diagnostic(&ecus, 0x0666, &[0x3E, 0x00]).is_err());
}
