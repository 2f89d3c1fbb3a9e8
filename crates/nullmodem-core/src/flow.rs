//! Per-transfer flow-control filtering
//!
//! A [`FlowFilter`] is a transient policy value built from the *receiving*
//! port's live handshake state immediately before a buffer transfer. It is
//! never persisted: a fresh instance is built for every transfer attempt, so
//! a handshake change between two attempts is always picked up.
//!
//! The filter decides, per source byte, whether the byte is delivered,
//! silently swallowed (NUL stripping, XON/XOFF interception under automatic
//! transmit flow control) or discarded wholesale (DSR sensitivity with DSR
//! low). It also accumulates the receive events the copy produced and the
//! last XON/XOFF state it intercepted, for the engine to apply afterwards.

use crate::buffer::RawData;
use crate::escape::CODE_LITERAL;
use crate::port::{event, msr, PortState};

/// Last intercepted software flow-control character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XonXoff {
    /// Resume transmission
    Xon,
    /// Hold transmission
    Xoff,
}

/// Transient per-copy filter; see module docs
#[derive(Debug, Default)]
pub struct FlowFilter {
    ignore_received: bool,
    auto_transmit: bool,
    xon_char: u8,
    xoff_char: u8,
    null_stripping: bool,
    ev_rxchar: bool,
    ev_rxflag: bool,
    event_char: u8,
    escape_char: Option<u8>,
    /// Receive events observed during the copy (`event::*` bits)
    pub events: u32,
    /// Last XON/XOFF intercepted during the copy, if any
    pub last_xon_xoff: Option<XonXoff>,
}

impl FlowFilter {
    /// Build a filter from the receiving port's current state
    pub(crate) fn build(port: &PortState) -> Self {
        let mut filter = Self::default();

        if port.handflow.dsr_sensitivity && port.modem_status & msr::DSR == 0 {
            filter.ignore_received = true;
            return filter;
        }

        if port.handflow.auto_transmit_xon_xoff {
            filter.auto_transmit = true;
            filter.xon_char = port.special_chars.xon;
            filter.xoff_char = port.special_chars.xoff;
        }

        filter.null_stripping = port.handflow.null_stripping;
        filter.ev_rxchar = port.wait_mask & event::RXCHAR != 0;
        if port.wait_mask & event::RXFLAG != 0 {
            filter.ev_rxflag = true;
            filter.event_char = port.special_chars.event;
        }
        filter.escape_char = port.escape_char;
        filter
    }
}

/// Merge bytes into `dest` in priority order: (a) the pending code byte of a
/// previously split escape pair, (b) queued side-channel bytes, (c) bytes
/// from `src`, filtered when a filter is given.
///
/// A source byte equal to the active escape character is emitted as the
/// literal-doubling pair `[esc, 0x00]`. When only one destination slot
/// remains for such a pair, the escape character is emitted and the owed
/// code byte is recorded in `pending_escape`; the next copy (or a direct
/// buffer read) resumes it. This deferral is what keeps reentrant partial
/// copies correct across repeated write attempts.
///
/// Returns `(produced, consumed)`: bytes placed into `dest` and bytes taken
/// from `src`. A swallowed source byte counts as consumed but produces
/// nothing.
pub(crate) fn copy_with_escape(
    pending_escape: &mut bool,
    insert_data: &mut RawData,
    filter: Option<&mut FlowFilter>,
    dest: &mut [u8],
    src: &[u8],
) -> (usize, usize) {
    let mut produced = 0;

    if *pending_escape && produced < dest.len() {
        dest[produced] = CODE_LITERAL;
        produced += 1;
        *pending_escape = false;
    }

    if !insert_data.is_empty() && produced < dest.len() {
        let n = insert_data.len().min(dest.len() - produced);
        dest[produced..produced + n].copy_from_slice(&insert_data.as_slice()[..n]);
        insert_data.compact(n);
        produced += n;
    }

    let consumed = match filter {
        None => {
            let n = src.len().min(dest.len() - produced);
            dest[produced..produced + n].copy_from_slice(&src[..n]);
            produced += n;
            n
        }
        Some(filter) if filter.ignore_received => src.len(),
        Some(filter) => {
            let mut consumed = 0;
            for &ch in src {
                if ch == 0 && filter.null_stripping {
                    consumed += 1;
                    continue;
                }
                if filter.auto_transmit && (ch == filter.xon_char || ch == filter.xoff_char) {
                    filter.last_xon_xoff = Some(if ch == filter.xoff_char {
                        XonXoff::Xoff
                    } else {
                        XonXoff::Xon
                    });
                    consumed += 1;
                    continue;
                }
                if produced >= dest.len() {
                    break;
                }
                dest[produced] = ch;
                produced += 1;
                if filter.ev_rxchar {
                    filter.events |= event::RXCHAR;
                }
                if filter.ev_rxflag && ch == filter.event_char {
                    filter.events |= event::RXFLAG;
                }
                if filter.escape_char == Some(ch) {
                    if produced >= dest.len() {
                        *pending_escape = true;
                    } else {
                        dest[produced] = CODE_LITERAL;
                        produced += 1;
                    }
                }
                consumed += 1;
            }
            consumed
        }
    };

    (produced, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn copy(filter: Option<&mut FlowFilter>, dest: &mut [u8], src: &[u8]) -> (usize, usize) {
        let mut pending = false;
        let mut insert = RawData::new();
        copy_with_escape(&mut pending, &mut insert, filter, dest, src)
    }

    #[test]
    fn test_unfiltered_copy_is_plain() {
        let mut dest = [0u8; 4];
        assert_eq!(copy(None, &mut dest, b"abcdef"), (4, 4));
        assert_eq!(&dest, b"abcd");
    }

    #[test]
    fn test_null_stripping_swallows_zeroes() {
        let mut filter = FlowFilter {
            null_stripping: true,
            ..Default::default()
        };
        let mut dest = [0u8; 8];
        let (produced, consumed) = copy(Some(&mut filter), &mut dest, b"a\0b\0c");
        assert_eq!((produced, consumed), (3, 5));
        assert_eq!(&dest[..3], b"abc");
    }

    #[test]
    fn test_xon_xoff_interception() {
        let mut filter = FlowFilter {
            auto_transmit: true,
            xon_char: 0x11,
            xoff_char: 0x13,
            ..Default::default()
        };
        let mut dest = [0u8; 8];
        let (produced, consumed) = copy(Some(&mut filter), &mut dest, &[b'a', 0x13, b'b', 0x11]);
        assert_eq!((produced, consumed), (2, 4));
        assert_eq!(&dest[..2], b"ab");
        assert_eq!(filter.last_xon_xoff, Some(XonXoff::Xon));
    }

    #[test]
    fn test_discard_all_consumes_without_producing() {
        let mut filter = FlowFilter {
            ignore_received: true,
            ..Default::default()
        };
        let mut dest = [0u8; 8];
        assert_eq!(copy(Some(&mut filter), &mut dest, b"abc"), (0, 3));
    }

    #[test]
    fn test_escape_doubling() {
        let mut filter = FlowFilter {
            escape_char: Some(0xFF),
            ..Default::default()
        };
        let mut dest = [0u8; 8];
        let (produced, consumed) = copy(Some(&mut filter), &mut dest, &[b'a', 0xFF, b'b']);
        assert_eq!((produced, consumed), (4, 3));
        assert_eq!(&dest[..4], &[b'a', 0xFF, CODE_LITERAL, b'b']);
    }

    #[test]
    fn test_split_escape_pair_defers_code_byte() {
        let mut filter = FlowFilter {
            escape_char: Some(0xFF),
            ..Default::default()
        };
        let mut pending = false;
        let mut insert = RawData::new();
        let mut dest = [0u8; 2];
        let (produced, consumed) =
            copy_with_escape(&mut pending, &mut insert, Some(&mut filter), &mut dest, &[b'a', 0xFF, b'b']);
        assert_eq!((produced, consumed), (2, 2));
        assert_eq!(&dest, &[b'a', 0xFF]);
        assert!(pending);

        // Next call resumes with the owed code byte ahead of new data.
        let mut dest2 = [0u8; 4];
        let (produced, consumed) =
            copy_with_escape(&mut pending, &mut insert, Some(&mut filter), &mut dest2, &[b'b']);
        assert_eq!((produced, consumed), (2, 1));
        assert_eq!(&dest2[..2], &[CODE_LITERAL, b'b']);
        assert!(!pending);
    }

    #[test]
    fn test_insert_data_precedes_source() {
        let mut pending = false;
        let mut insert = RawData::from_slice(b"xy");
        let mut dest = [0u8; 8];
        let (produced, consumed) =
            copy_with_escape(&mut pending, &mut insert, None, &mut dest, b"ab");
        assert_eq!((produced, consumed), (4, 2));
        assert_eq!(&dest[..4], b"xyab");
        assert!(insert.is_empty());
    }

    #[test]
    fn test_rxchar_and_rxflag_events() {
        let mut filter = FlowFilter {
            ev_rxchar: true,
            ev_rxflag: true,
            event_char: b'!',
            ..Default::default()
        };
        let mut dest = [0u8; 8];
        copy(Some(&mut filter), &mut dest, b"a!");
        assert_eq!(filter.events, event::RXCHAR | event::RXFLAG);
    }
}
