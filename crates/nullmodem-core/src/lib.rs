//! # NullModem Core
//!
//! Data-path engine for a virtual null-modem cable: a pair of linked
//! serial endpoints where bytes written to one appear as bytes read from
//! the other, with full serial-port semantics.
//!
//! This library provides:
//! - A [`port::PortPair`] of linked ports sharing one lock, each usable as
//!   an ordinary serial device from any thread
//! - Flow control (RTS/CTS and DTR/DSR handshake, XON/XOFF interception,
//!   DSR sensitivity, NUL stripping) applied per transfer
//! - Out-of-band status injection: line/modem status, remote baud rate and
//!   line control multiplexed into the data stream through an escape
//!   convention, with a symmetric chunk-tolerant decoder
//! - Cancellation-safe blocking I/O: every pending operation is completed
//!   exactly once, by normal completion, cancel or timeout
//!
//! ## Example
//!
//! ```rust
//! use nullmodem_core::port::{BufferClass, PortPair};
//!
//! let pair = PortPair::new(BufferClass::Large);
//! let (a, b) = pair.ports();
//! a.open().unwrap();
//! b.open().unwrap();
//!
//! a.write(b"hello", None).unwrap();
//! let mut buf = [0u8; 5];
//! b.read(&mut buf, None).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod escape;
pub mod flow;
mod io;
pub mod port;
mod request;

pub use error::Error;
pub use request::{CompletionStatus, Outcome};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::escape::{InsertOptions, StatusDecoder, StatusEvent};
    pub use crate::port::{
        BufferClass, DtrMode, Handflow, LineControl, Operation, Port, PortPair, QueueStatus,
        RtsMode, SpecialChars,
    };
    pub use crate::request::{CompletionStatus, Outcome};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
