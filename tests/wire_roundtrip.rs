//! End-to-end wire codec coverage: a full message with every section
//! populated, round-tripped through the public `encode_message`/
//! `decode_message` pair rather than the per-record unit tests already
//! colocated with the codec.

use std::net::Ipv4Addr;

use mdns_engine::wire::{decode_message, encode_message, Header, Message, Name, Question, Record, RecordData, RecordType};

#[test]
fn full_message_with_all_sections_round_trips() {
    let mut msg = Message {
        header: Header { id: 0xBEEF, query: false, opcode: 0, authoritative: true, truncated: false, response_code: 0 },
        ..Default::default()
    };

    msg.questions.push(Question {
        name: Name::from_dotted("_http._tcp.local"),
        ty: RecordType::PTR,
        unicast_response: false,
    });

    msg.answers.push(Record {
        name: Name::from_dotted("_http._tcp.local"),
        ttl: 4500,
        flush: false,
        data: RecordData::Ptr(Name::from_dotted("printer._http._tcp.local")),
    });

    msg.answers.push(Record {
        name: Name::from_dotted("printer._http._tcp.local"),
        ttl: 120,
        flush: true,
        data: RecordData::Srv { priority: 0, weight: 0, port: 631, target: Name::from_dotted("printer.local") },
    });

    msg.additional.push(Record {
        name: Name::from_dotted("printer.local"),
        ttl: 120,
        flush: true,
        data: RecordData::A(Ipv4Addr::new(192, 168, 1, 50)),
    });

    let encoded = encode_message(&msg).expect("message fits under the payload limit");
    assert!(encoded.len() <= mdns_engine::wire::MAX_PAYLOAD_SIZE);

    let decoded = decode_message(&encoded).expect("well-formed message decodes");
    assert_eq!(decoded.header.id, 0xBEEF);
    assert!(decoded.header.authoritative);
    assert_eq!(decoded.questions.len(), 1);
    assert_eq!(decoded.answers.len(), 2);
    assert_eq!(decoded.additional.len(), 1);

    match &decoded.answers[0].data {
        RecordData::Ptr(target) => assert_eq!(target.to_dotted(), "printer._http._tcp.local"),
        other => panic!("expected PTR, got {other:?}"),
    }
    match &decoded.answers[1].data {
        RecordData::Srv { port, .. } => assert_eq!(*port, 631),
        other => panic!("expected SRV, got {other:?}"),
    }
    assert!(decoded.additional[0].flush);
}

#[test]
fn truncated_buffer_is_rejected_outright() {
    let buf = [0u8; 4];
    assert!(decode_message(&buf).is_err());
}

#[test]
fn message_over_payload_limit_is_rejected() {
    let mut msg = Message::new(1, false, true);
    for i in 0..400u32 {
        msg.answers.push(Record {
            name: Name::from_dotted(&format!("instance-{i}._http._tcp.local")),
            ttl: 120,
            flush: true,
            data: RecordData::A(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8)),
        });
    }
    assert!(encode_message(&msg).is_err());
}
