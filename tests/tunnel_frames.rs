//! Framing and encryption, end to end: what a worker uploads is what
//! a server-side decoder recovers

use bytes::Bytes;
use charon::buffers::{ReadBuffer, WriteBuffer};
use charon::crypto::Encryptor;
use charon::wire::{
    build_ack, next_conn_record, next_sn_record, parse_ack, put_conn_record, put_sn_record,
    ConnCommand, ConnFrame, TransferRequest,
};

#[test]
fn full_upload_roundtrip_through_encryption() {
    // one sn record carrying two connection commands
    let connect = ConnFrame {
        seq: 0,
        cmd: ConnCommand::Connect {
            sock_type: 0,
            host: Bytes::from_static(b"example.net"),
            port: 443,
        },
    };
    let data = ConnFrame {
        seq: 1,
        cmd: ConnCommand::Data(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")),
    };

    let mut payload = WriteBuffer::new();
    put_conn_record(&mut payload, 2, &connect.encode());
    put_conn_record(&mut payload, 2, &data.encode());
    let payload = payload.freeze();

    let mut upload = WriteBuffer::new();
    put_sn_record(&mut upload, 1, &payload);

    let request = TransferRequest {
        session_id: *b"aabbccdd",
        transfer_no: 9,
        server_timeout: 3,
        data: upload.freeze(),
        ack: build_ack(4, &[6]),
    };

    let encryptor = Encryptor::new("chacha20-poly1305", "shared-password").unwrap();
    let wire = encryptor.encrypt(&request.encode()).unwrap();

    // server side
    let plain = encryptor.decrypt(&wire).unwrap();
    let decoded = TransferRequest::decode(Bytes::from(plain)).unwrap();
    assert_eq!(decoded.session_id, *b"aabbccdd");
    assert_eq!(decoded.transfer_no, 9);

    let mut r = ReadBuffer::new(decoded.data);
    let (sn, payload) = next_sn_record(&mut r).unwrap().unwrap();
    assert_eq!(sn, 1);
    assert!(next_sn_record(&mut r).unwrap().is_none());

    let mut p = ReadBuffer::new(payload);
    let (conn_id, block) = next_conn_record(&mut p).unwrap().unwrap();
    assert_eq!(conn_id, 2);
    assert_eq!(ConnFrame::decode(block).unwrap(), connect);
    let (conn_id, block) = next_conn_record(&mut p).unwrap().unwrap();
    assert_eq!(conn_id, 2);
    assert_eq!(ConnFrame::decode(block).unwrap(), data);
    assert!(next_conn_record(&mut p).unwrap().is_none());

    assert_eq!(parse_ack(decoded.ack).unwrap(), (4, vec![6]));
}

#[test]
fn plaintext_when_encryption_disabled() {
    let request = TransferRequest {
        session_id: *b"aabbccdd",
        transfer_no: 1,
        server_timeout: 0,
        data: Bytes::new(),
        ack: Bytes::new(),
    };
    let encryptor = Encryptor::new("none", "").unwrap();
    let wire = encryptor.encrypt(&request.encode()).unwrap();
    assert_eq!(Bytes::from(wire.clone()), request.encode());
    assert_eq!(
        TransferRequest::decode(Bytes::from(wire)).unwrap(),
        request
    );
}
