//! Broker matcher scenarios over the JSON wire shapes.

use webtor::broker::{BrokerMessage, BrokerState, PartyMessage};

#[test]
fn three_registrations_two_matches_one_answer() {
    let mut broker = BrokerState::new();

    // Three volunteer proxies register.
    let mut proxy_ids = Vec::new();
    for conn in 1u64..=3 {
        broker.connection_opened(conn);
        let out = broker.handle_json(
            conn,
            &format!(
                r#"{{"type":"register","sdp_offer":"offer-{conn}","ice_candidates":["cand-{conn}"]}}"#
            ),
            100 + conn,
        );
        assert_eq!(out.len(), 1);
        match &out[0].message {
            BrokerMessage::Registered { proxy_id, pool_size } => {
                assert_eq!(*pool_size, conn as usize);
                proxy_ids.push(proxy_id.clone());
            }
            other => panic!("expected registered, got {other:?}"),
        }
    }

    // Two clients request; they get distinct proxies, oldest first.
    let mut matched = Vec::new();
    for client in [10u64, 11] {
        broker.connection_opened(client);
        let out = broker.handle_json(client, r#"{"type":"request"}"#, 500);
        match &out[0].message {
            BrokerMessage::Matched {
                proxy_id,
                sdp_offer,
                ice_candidates,
            } => {
                assert!(!matched.contains(proxy_id), "same proxy matched twice");
                assert!(sdp_offer.starts_with("offer-"));
                assert_eq!(ice_candidates.len(), 1);
                matched.push(proxy_id.clone());
            }
            other => panic!("expected matched, got {other:?}"),
        }
    }
    assert_eq!(matched[0], proxy_ids[0]);
    assert_eq!(matched[1], proxy_ids[1]);
    assert_eq!(broker.pool_size(), 1);

    // One client answers: the proxy connection receives CONNECT with the
    // answer byte-for-byte, and the broker forgets the pair.
    let answer_sdp = "v=0\r\no=client 42 2 IN IP4 0.0.0.0\r\n";
    let out = broker.handle(
        10,
        PartyMessage::Answer {
            proxy_id: matched[0].clone(),
            sdp_answer: answer_sdp.to_string(),
            ice_candidates: vec!["candidate:1 1 udp 1 0.0.0.0 9 typ host".into()],
        },
        600,
    );
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].connection, 1, "CONNECT goes to the proxy's socket");
    match &out[0].message {
        BrokerMessage::Connect { sdp_answer, .. } => assert_eq!(sdp_answer, answer_sdp),
        other => panic!("expected connect, got {other:?}"),
    }
    assert_eq!(out[1].message, BrokerMessage::AnswerSent {});
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.pool_size(), 1);
}

#[test]
fn json_wire_round_trips_byte_for_byte() {
    // The CONNECT the proxy receives must carry the exact client bytes
    // even through serialize/deserialize.
    let sdp = "a=fingerprint:sha-256 AA:BB\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
    let connect = BrokerMessage::Connect {
        sdp_answer: sdp.to_string(),
        ice_candidates: vec!["candidate:0 1 udp 2122260223 192.0.2.1 54400 typ host".into()],
    };
    let json = serde_json::to_string(&connect).unwrap();
    let back: BrokerMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(back, connect);
}

#[test]
fn unknown_type_and_missing_fields_get_error_strings() {
    let mut broker = BrokerState::new();
    broker.connection_opened(1);

    for bad in [
        r#"{"type":"subscribe"}"#,
        r#"{"type":"register"}"#,
        r#"{"no_type":true}"#,
        "not json at all",
    ] {
        let out = broker.handle_json(1, bad, 100);
        assert_eq!(out.len(), 1, "{bad}");
        assert!(
            matches!(out[0].message, BrokerMessage::Error { .. }),
            "{bad} should error"
        );
    }
    // the connection stays usable afterward
    let out = broker.handle_json(1, r#"{"type":"request"}"#, 100);
    assert_eq!(out[0].message, BrokerMessage::NoProxies {});
}
