//! Integration tests for the SSH wire codec

use gantry::wire::{
    EnvRequest, ExecRequest, ExitSignalMessage, ExitStatusMessage, PtyRequest, SignalRequest,
    SubsystemRequest, WindowChangeRequest, WireError, Writer,
};

fn string_field(value: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(value);
    w.into_bytes()
}

#[test]
fn env_request_decodes_name_and_value() {
    let mut payload = string_field("LANG");
    payload.extend(string_field("en_US.UTF8"));

    let msg = EnvRequest::decode(&payload).expect("decode");
    assert_eq!(msg.name, "LANG");
    assert_eq!(msg.value, "en_US.UTF8");
}

#[test]
fn env_request_rejects_truncated_payload() {
    // Length prefix promises four bytes, only two follow.
    let payload = [0, 0, 0, 4, b'a', b'b'];
    assert!(matches!(
        EnvRequest::decode(&payload),
        Err(WireError::Truncated { .. })
    ));
}

#[test]
fn env_request_rejects_trailing_bytes() {
    let mut payload = string_field("A");
    payload.extend(string_field("B"));
    payload.push(0xff);

    assert_eq!(
        EnvRequest::decode(&payload),
        Err(WireError::TrailingBytes(1))
    );
}

#[test]
fn env_request_rejects_oversized_length_prefix() {
    // A length prefix far beyond the limit must fail before allocating.
    let payload = [0xff, 0xff, 0xff, 0xff];
    assert!(matches!(
        EnvRequest::decode(&payload),
        Err(WireError::StringTooLong { .. })
    ));
}

#[test]
fn pty_request_roundtrips_with_modelist() {
    let request = PtyRequest {
        term: "xterm-256color".to_string(),
        columns: 80,
        rows: 24,
        width_px: 640,
        height_px: 480,
        modelist: vec![53, 0, 0, 0, 0, 0],
    };

    let decoded = PtyRequest::decode(&request.encode()).expect("decode");
    assert_eq!(decoded, request);
}

#[test]
fn window_change_is_four_big_endian_words() {
    let payload = [
        0, 0, 0, 132, // columns
        0, 0, 0, 40, // rows
        0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let msg = WindowChangeRequest::decode(&payload).expect("decode");
    assert_eq!(msg.columns, 132);
    assert_eq!(msg.rows, 40);
}

#[test]
fn signal_request_carries_the_bare_name() {
    let msg = SignalRequest::decode(&string_field("TERM")).expect("decode");
    assert_eq!(msg.signal, "TERM");
}

#[test]
fn exec_request_rejects_invalid_utf8() {
    let payload = [0, 0, 0, 2, 0xff, 0xfe];
    assert_eq!(ExecRequest::decode(&payload), Err(WireError::InvalidUtf8));
}

#[test]
fn subsystem_request_decodes_name() {
    let msg = SubsystemRequest::decode(&string_field("sftp")).expect("decode");
    assert_eq!(msg.name, "sftp");
}

#[test]
fn exit_status_encodes_big_endian() {
    let encoded = ExitStatusMessage { status: 255 }.encode();
    assert_eq!(encoded, vec![0, 0, 0, 255]);

    let decoded = ExitStatusMessage::decode(&encoded).expect("decode");
    assert_eq!(decoded.status, 255);
}

#[test]
fn exit_signal_roundtrips() {
    let message = ExitSignalMessage {
        signal: "SEGV".to_string(),
        core_dumped: true,
        error_message: String::new(),
        language_tag: String::new(),
    };

    let decoded = ExitSignalMessage::decode(&message.encode()).expect("decode");
    assert_eq!(decoded, message);
}

#[test]
fn empty_payload_decodes_as_nothing() {
    assert!(matches!(
        ExecRequest::decode(&[]),
        Err(WireError::Truncated { .. })
    ));
}
