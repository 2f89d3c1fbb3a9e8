//! End-to-end tests for escape-mode status multiplexing

use std::time::Duration;

use nullmodem_core::escape::{InsertOptions, StatusDecoder, StatusEvent};
use nullmodem_core::port::{msr, pin, BufferClass, LineControl, PortPair};

const ESC: u8 = 0xFF;
const LONG: Option<Duration> = Some(Duration::from_secs(5));
const SHORT: Option<Duration> = Some(Duration::from_millis(100));

fn all_options() -> InsertOptions {
    InsertOptions {
        line_status: true,
        modem_status: true,
        baud_rate: true,
        line_control: true,
    }
}

fn decode_port(port: &nullmodem_core::port::Port) -> Vec<StatusEvent> {
    let mut decoder = StatusDecoder::new(ESC);
    let mut events = Vec::new();
    // Read in deliberately tiny chunks; the decoder must not care.
    loop {
        let mut buf = [0u8; 3];
        match port.read(&mut buf, SHORT) {
            Ok(n) => decoder.push(&buf[..n], &mut events),
            Err(_) => break,
        }
    }
    // Chunked reads split data runs; merge them back for comparison.
    let mut merged: Vec<StatusEvent> = Vec::new();
    for event in events {
        match (merged.last_mut(), event) {
            (Some(StatusEvent::Data(tail)), StatusEvent::Data(more)) => {
                tail.extend_from_slice(&more)
            }
            (_, event) => merged.push(event),
        }
    }
    merged
}

#[test]
fn test_escape_char_in_data_is_doubled() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_escape_mode(Some(ESC), all_options());

    a.write(&[1, ESC, 2], LONG).unwrap();

    // The wire carries four bytes for three of payload.
    let mut buf = [0u8; 4];
    assert_eq!(b.read(&mut buf, LONG).unwrap(), 4);
    assert_eq!(buf, [1, ESC, 0x00, 2]);

    let mut decoder = StatusDecoder::new(ESC);
    let mut events = Vec::new();
    decoder.push(&buf, &mut events);
    assert_eq!(events, vec![StatusEvent::Data(vec![1, ESC, 2])]);
}

#[test]
fn test_modem_status_injected_on_pin_change() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_escape_mode(Some(ESC), all_options());

    a.set_pins(0, pin::RTS).unwrap();

    let events = decode_port(&b);
    assert_eq!(
        events,
        vec![StatusEvent::ModemStatus(msr::DSR | msr::RLSD)]
    );
}

#[test]
fn test_baud_and_line_control_announced() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_escape_mode(Some(ESC), all_options());

    a.set_baud_rate(115_200).unwrap();
    a.set_line_control(LineControl {
        word_length: 7,
        parity: 2,
        stop_bits: 1,
    });

    let events = decode_port(&b);
    assert_eq!(
        events,
        vec![
            StatusEvent::BaudRate(115_200),
            StatusEvent::LineControl {
                word_length: 7,
                parity: 2,
                stop_bits: 1
            },
        ]
    );
}

#[test]
fn test_break_injected_as_line_status() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_escape_mode(Some(ESC), all_options());

    a.set_pins(pin::BREAK, pin::BREAK).unwrap();

    let events = decode_port(&b);
    assert_eq!(
        events,
        vec![StatusEvent::LineStatus {
            lsr: nullmodem_core::port::lsr::BREAK,
            data: None
        }]
    );
}

#[test]
fn test_status_interleaves_with_data_in_order() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_escape_mode(Some(ESC), all_options());

    a.write(b"pre", LONG).unwrap();
    a.set_baud_rate(19_200).unwrap();
    a.write(b"post", LONG).unwrap();

    let events = decode_port(&b);
    assert_eq!(
        events,
        vec![
            StatusEvent::Data(b"pre".to_vec()),
            StatusEvent::BaudRate(19_200),
            StatusEvent::Data(b"post".to_vec()),
        ]
    );
}

#[test]
fn test_no_injection_without_escape_mode() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    a.set_baud_rate(19_200).unwrap();
    a.set_pins(0, pin::RTS).unwrap();

    let mut buf = [0u8; 8];
    assert!(b.read(&mut buf, SHORT).is_err());
}
