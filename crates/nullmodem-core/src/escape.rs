//! Status escape multiplexing
//!
//! Out-of-band status events (line status, modem status, remote baud rate
//! and line control changes) are carried in-band: a configurable escape
//! character marks the start of a short sequence consisting of a one-byte
//! code and a fixed-length payload. A data byte that happens to equal the
//! escape character is transmitted as the literal-doubling pair
//! `[esc, 0x00]`.
//!
//! Wire format (code byte follows the escape character):
//! - `0x00` — literal escape character, no payload
//! - `0x01` — line status, followed by the LSR byte and the data byte it
//!   applies to
//! - `0x02` — line status, followed by the LSR byte only
//! - `0x03` — modem status, followed by the MSR byte
//! - `0x04` — remote baud rate, followed by a little-endian u32
//! - `0x05` — remote line control, followed by word length, parity and
//!   stop bits
//!
//! Both sides of the contract live here: the sequence builders used by the
//! injection path and [`StatusDecoder`], a byte-at-a-time state machine that
//! tolerates sequences split across arbitrarily small reads.

use serde::{Deserialize, Serialize};

/// Code byte: literal escape character.
pub const CODE_LITERAL: u8 = 0x00;
/// Code byte: line status with the data byte it applies to.
pub const CODE_LSR_DATA: u8 = 0x01;
/// Code byte: line status without data.
pub const CODE_LSR_NODATA: u8 = 0x02;
/// Code byte: modem status.
pub const CODE_MST: u8 = 0x03;
/// Code byte: remote baud rate (u32, little-endian).
pub const CODE_RBR: u8 = 0x04;
/// Code byte: remote line control (word length, parity, stop bits).
pub const CODE_RLC: u8 = 0x05;

/// Which status classes a port wants injected into its receive stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InsertOptions {
    /// Inject line-status sequences (break, overrun)
    pub line_status: bool,
    /// Inject modem-status sequences (CTS/DSR/RING/RLSD changes)
    pub modem_status: bool,
    /// Inject remote baud rate changes
    pub baud_rate: bool,
    /// Inject remote line control changes
    pub line_control: bool,
}

/// Encode a line-status sequence without a data byte
pub fn lsr_seq(esc: u8, lsr: u8) -> [u8; 3] {
    [esc, CODE_LSR_NODATA, lsr]
}

/// Encode a line-status sequence tied to a data byte
pub fn lsr_data_seq(esc: u8, lsr: u8, data: u8) -> [u8; 4] {
    [esc, CODE_LSR_DATA, lsr, data]
}

/// Encode a modem-status sequence
pub fn mst_seq(esc: u8, msr: u8) -> [u8; 3] {
    [esc, CODE_MST, msr]
}

/// Encode a remote-baud-rate sequence
pub fn rbr_seq(esc: u8, baud: u32) -> [u8; 6] {
    let b = baud.to_le_bytes();
    [esc, CODE_RBR, b[0], b[1], b[2], b[3]]
}

/// Encode a remote-line-control sequence
pub fn rlc_seq(esc: u8, word_length: u8, parity: u8, stop_bits: u8) -> [u8; 5] {
    [esc, CODE_RLC, word_length, parity, stop_bits]
}

/// A status event recovered from an escaped stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Ordinary data bytes (escape doubling already undone)
    Data(Vec<u8>),
    /// Line status, with the data byte it applied to if any
    LineStatus { lsr: u8, data: Option<u8> },
    /// Modem status register
    ModemStatus(u8),
    /// Remote baud rate
    BaudRate(u32),
    /// Remote line control
    LineControl {
        word_length: u8,
        parity: u8,
        stop_bits: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Data,
    Marker,
    Payload { code: u8, have: u8 },
}

/// Streaming decoder for the escape wire format.
///
/// Symmetric with the injection side: the marker, code and payload bytes may
/// arrive in separate chunks and the decoder carries its state across calls.
#[derive(Debug)]
pub struct StatusDecoder {
    escape_char: u8,
    state: DecodeState,
    payload: [u8; 4],
    data: Vec<u8>,
}

impl StatusDecoder {
    /// Create a decoder for a stream escaped with `escape_char`
    pub fn new(escape_char: u8) -> Self {
        Self {
            escape_char,
            state: DecodeState::Data,
            payload: [0; 4],
            data: Vec::new(),
        }
    }

    fn payload_len(code: u8) -> Option<u8> {
        match code {
            CODE_LITERAL => Some(0),
            CODE_LSR_NODATA | CODE_MST => Some(1),
            CODE_LSR_DATA => Some(2),
            CODE_RLC => Some(3),
            CODE_RBR => Some(4),
            _ => None,
        }
    }

    fn flush_data(&mut self, out: &mut Vec<StatusEvent>) {
        if !self.data.is_empty() {
            out.push(StatusEvent::Data(std::mem::take(&mut self.data)));
        }
    }

    fn finish(&mut self, code: u8, out: &mut Vec<StatusEvent>) {
        match code {
            CODE_LITERAL => self.data.push(self.escape_char),
            CODE_LSR_DATA => {
                // The data byte a status applies to stays in the stream.
                self.data.push(self.payload[1]);
                self.flush_data(out);
                out.push(StatusEvent::LineStatus {
                    lsr: self.payload[0],
                    data: Some(self.payload[1]),
                });
            }
            CODE_LSR_NODATA => {
                self.flush_data(out);
                out.push(StatusEvent::LineStatus {
                    lsr: self.payload[0],
                    data: None,
                });
            }
            CODE_MST => {
                self.flush_data(out);
                out.push(StatusEvent::ModemStatus(self.payload[0]));
            }
            CODE_RBR => {
                self.flush_data(out);
                out.push(StatusEvent::BaudRate(u32::from_le_bytes(self.payload)));
            }
            CODE_RLC => {
                self.flush_data(out);
                out.push(StatusEvent::LineControl {
                    word_length: self.payload[0],
                    parity: self.payload[1],
                    stop_bits: self.payload[2],
                });
            }
            _ => unreachable!("finish called with unknown code"),
        }
        self.state = DecodeState::Data;
    }

    /// Feed a chunk of the escaped stream, appending recovered events to
    /// `out`. Consecutive data bytes are coalesced into one
    /// [`StatusEvent::Data`].
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<StatusEvent>) {
        for &ch in chunk {
            match self.state {
                DecodeState::Data => {
                    if ch == self.escape_char {
                        self.state = DecodeState::Marker;
                    } else {
                        self.data.push(ch);
                    }
                }
                DecodeState::Marker => match Self::payload_len(ch) {
                    Some(0) => self.finish(ch, out),
                    Some(_) => self.state = DecodeState::Payload { code: ch, have: 0 },
                    None => {
                        tracing::warn!(code = ch, "unknown escape code, resynchronizing");
                        self.state = DecodeState::Data;
                    }
                },
                DecodeState::Payload { code, have } => {
                    self.payload[have as usize] = ch;
                    let have = have + 1;
                    if have == Self::payload_len(code).unwrap_or(0) {
                        self.finish(code, out);
                    } else {
                        self.state = DecodeState::Payload { code, have };
                    }
                }
            }
        }
        self.flush_data(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(esc: u8, stream: &[u8]) -> Vec<StatusEvent> {
        let mut dec = StatusDecoder::new(esc);
        let mut out = Vec::new();
        dec.push(stream, &mut out);
        out
    }

    #[test]
    fn test_literal_escape_roundtrip() {
        let events = decode_all(0xFF, &[b'a', 0xFF, CODE_LITERAL, b'b']);
        assert_eq!(events, vec![StatusEvent::Data(vec![b'a', 0xFF, b'b'])]);
    }

    #[test]
    fn test_modem_status_sequence() {
        let seq = mst_seq(0xFF, 0x30);
        let events = decode_all(0xFF, &seq);
        assert_eq!(events, vec![StatusEvent::ModemStatus(0x30)]);
    }

    #[test]
    fn test_baud_rate_roundtrip() {
        let seq = rbr_seq(0xFF, 115_200);
        let events = decode_all(0xFF, &seq);
        assert_eq!(events, vec![StatusEvent::BaudRate(115_200)]);
    }

    #[test]
    fn test_lsr_with_data_keeps_data_in_stream() {
        let mut stream = vec![b'x'];
        stream.extend_from_slice(&lsr_data_seq(0xFF, 0x02, b'y'));
        let events = decode_all(0xFF, &stream);
        assert_eq!(
            events,
            vec![
                StatusEvent::Data(vec![b'x', b'y']),
                StatusEvent::LineStatus {
                    lsr: 0x02,
                    data: Some(b'y')
                },
            ]
        );
    }

    #[test]
    fn test_split_at_every_boundary() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"ab");
        stream.extend_from_slice(&rlc_seq(0xFF, 8, 0, 0));
        stream.extend_from_slice(&[0xFF, CODE_LITERAL]);
        stream.extend_from_slice(b"cd");

        let expected = decode_all(0xFF, &stream);
        for split in 0..=stream.len() {
            let mut dec = StatusDecoder::new(0xFF);
            let mut out = Vec::new();
            dec.push(&stream[..split], &mut out);
            dec.push(&stream[split..], &mut out);
            // Data runs may be chunked differently across splits; compare
            // after normalizing.
            assert_eq!(normalize(out), normalize(expected.clone()), "split {split}");
        }
    }

    fn normalize(events: Vec<StatusEvent>) -> Vec<StatusEvent> {
        let mut out: Vec<StatusEvent> = Vec::new();
        for ev in events {
            match (out.last_mut(), ev) {
                (Some(StatusEvent::Data(tail)), StatusEvent::Data(more)) => {
                    tail.extend_from_slice(&more)
                }
                (_, ev) => out.push(ev),
            }
        }
        out
    }

    #[test]
    fn test_unknown_code_resynchronizes() {
        let events = decode_all(0xFF, &[0xFF, 0x7E, b'z']);
        assert_eq!(events, vec![StatusEvent::Data(vec![b'z'])]);
    }
}
