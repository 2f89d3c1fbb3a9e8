//! Port pair and per-port control surface
//!
//! A [`PortPair`] is the virtual cable: two [`Port`]s sharing one lock, each
//! owning the ring buffer its peer writes into. All mutable state for one
//! pair lives behind that single lock; request completions are collected
//! inside the critical section and delivered after it ends, so nothing ever
//! re-enters the lock from a completion.
//!
//! The control surface maps the usual serial ioctl set onto explicit
//! methods: handshake settings, special characters, escape-mode injection,
//! baud rate and line control, pin outputs with a change mask, purge, queue
//! occupancy, wait masks and manual XON/XOFF.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buffer::RingBuffer;
use crate::error::Error;
use crate::escape::InsertOptions;
use crate::io;
use crate::request::{CompletionStatus, Completions, Kind, Outcome, Payload, Request, RequestQueue};

/// Event bits for wait masks and wait results
pub mod event {
    /// A character was received
    pub const RXCHAR: u32 = 0x0001;
    /// The configured event character was received
    pub const RXFLAG: u32 = 0x0002;
    /// The transmit queue drained completely
    pub const TXEMPTY: u32 = 0x0004;
    /// CTS changed state
    pub const CTS: u32 = 0x0008;
    /// DSR changed state
    pub const DSR: u32 = 0x0010;
    /// RLSD (carrier detect) changed state
    pub const RLSD: u32 = 0x0020;
    /// The peer set or cleared BREAK
    pub const BREAK: u32 = 0x0040;
    /// A line-status error (overrun) was recorded
    pub const ERR: u32 = 0x0080;
    /// RING changed state
    pub const RING: u32 = 0x0100;
    /// Receive buffer occupancy crossed the 80% watermark
    pub const RX80FULL: u32 = 0x0400;
}

/// Modem-status register bits
pub mod msr {
    /// Clear to send
    pub const CTS: u8 = 0x10;
    /// Data set ready
    pub const DSR: u8 = 0x20;
    /// Ring indicator
    pub const RING: u8 = 0x40;
    /// Receive line signal (carrier) detect
    pub const RLSD: u8 = 0x80;
}

/// Line-status register bits
pub mod lsr {
    /// Receive overrun
    pub const OVERRUN: u8 = 0x02;
    /// Break condition
    pub const BREAK: u8 = 0x10;
}

/// Pin bits for [`Port::set_pins`]
pub mod pin {
    /// Request to send
    pub const RTS: u8 = 0x01;
    /// Data terminal ready
    pub const DTR: u8 = 0x02;
    /// Auxiliary output, wired to the peer's RING
    pub const OUT1: u8 = 0x04;
    /// Break condition on the transmit line
    pub const BREAK: u8 = 0x10;
}

/// Flags for [`Port::purge`]
pub mod purge {
    /// Cancel all pending reads
    pub const RX_ABORT: u8 = 0x01;
    /// Cancel all pending writes
    pub const TX_ABORT: u8 = 0x02;
    /// Discard buffered receive data
    pub const RX_CLEAR: u8 = 0x04;
    /// Accepted for symmetry; there is no transmit buffer to clear
    pub const TX_CLEAR: u8 = 0x08;
}

/// Receive buffer size selected at open, by host class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferClass {
    /// 4096-byte receive buffer
    #[default]
    Large,
    /// 1024-byte receive buffer
    Medium,
    /// 128-byte receive buffer
    Small,
    /// Zero-size degraded buffer; direct reader-to-writer copies still work
    Minimal,
}

impl BufferClass {
    pub(crate) fn size(self) -> usize {
        match self {
            BufferClass::Large => 4096,
            BufferClass::Medium => 1024,
            BufferClass::Small => 128,
            BufferClass::Minimal => 0,
        }
    }
}

/// DTR line behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DtrMode {
    /// DTR held low
    Disabled,
    /// DTR held high while the port is open
    #[default]
    Enabled,
    /// Driven by receive-buffer occupancy against the watermark
    Handshake,
}

/// RTS line behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RtsMode {
    /// RTS held low
    Disabled,
    /// RTS held high while the port is open
    #[default]
    Enabled,
    /// Driven by receive-buffer occupancy against the watermark
    Handshake,
}

/// Configured flow-control behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Handflow {
    /// DTR line behavior
    pub dtr: DtrMode,
    /// RTS line behavior
    pub rts: RtsMode,
    /// Hold transmit while CTS is low
    pub cts_out_flow: bool,
    /// Hold transmit while DSR is low
    pub dsr_out_flow: bool,
    /// Discard all received data while DSR is low
    pub dsr_sensitivity: bool,
    /// Intercept XON/XOFF from the peer and hold/release transmit
    pub auto_transmit_xon_xoff: bool,
    /// Swallow received NUL bytes
    pub null_stripping: bool,
    /// Keep transmitting own data while holding the peer with XOFF
    pub xoff_continue: bool,
}

/// XON/XOFF and event characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialChars {
    /// Software flow-control resume character
    pub xon: u8,
    /// Software flow-control hold character
    pub xoff: u8,
    /// Character that fires the RXFLAG event
    pub event: u8,
}

impl Default for SpecialChars {
    fn default() -> Self {
        Self {
            xon: 0x11,
            xoff: 0x13,
            event: 0,
        }
    }
}

/// Word length, parity and stop bits, carried verbatim in the escape wire
/// format's line-control sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineControl {
    /// Data bits per word
    pub word_length: u8,
    /// Parity selector, carried as a raw byte
    pub parity: u8,
    /// Stop-bits selector, carried as a raw byte
    pub stop_bits: u8,
}

impl Default for LineControl {
    fn default() -> Self {
        Self {
            word_length: 8,
            parity: 0,
            stop_bits: 0,
        }
    }
}

/// Buffer occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Bytes a reader could obtain right now, side-channel included
    pub rx_queued: usize,
    /// Bytes pending across the port's write requests
    pub tx_queued: usize,
}

/// Which end of the pair a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    A,
    B,
}

impl Side {
    pub(crate) fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::A => "A",
            Side::B => "B",
        }
    }
}

/// All mutable state of one port, guarded by the pair lock
#[derive(Debug)]
pub(crate) struct PortState {
    pub buffer: RingBuffer,
    pub read_q: RequestQueue,
    pub write_q: RequestQueue,
    pub wait_q: RequestQueue,
    pub open: bool,
    pub handflow: Handflow,
    pub special_chars: SpecialChars,
    pub escape_char: Option<u8>,
    pub insert_opts: InsertOptions,
    /// Manual pin outputs (`pin::*` bits)
    pub pins: u8,
    /// RTS/DTR handshake gate: true while the receive buffer is at or above
    /// the watermark
    pub above_watermark: bool,
    /// Inputs as driven by the peer's outputs (`msr::*` bits)
    pub modem_status: u8,
    /// Peer's BREAK state as last seen, for edge detection
    pub remote_break: bool,
    pub wait_mask: u32,
    pub events: u32,
    pub baud_rate: u32,
    pub line_control: LineControl,
    /// Accumulated error bits (`lsr::OVERRUN`), cleared by [`Port::errors`]
    pub errors: u32,
    pub emulate_overrun: bool,
    /// Transmit held because the peer sent XOFF (or a manual
    /// [`Port::xoff`])
    pub tx_held_by_xoff: bool,
    /// Remaining write-pacing quota; `None` when pacing is off
    pub pace_quota: Option<usize>,
}

impl PortState {
    fn new() -> Self {
        Self {
            buffer: RingBuffer::new(0),
            read_q: RequestQueue::new(),
            write_q: RequestQueue::new(),
            wait_q: RequestQueue::new(),
            open: false,
            handflow: Handflow::default(),
            special_chars: SpecialChars::default(),
            escape_char: None,
            insert_opts: InsertOptions::default(),
            pins: 0,
            above_watermark: false,
            modem_status: 0,
            remote_break: false,
            wait_mask: 0,
            events: 0,
            baud_rate: 9600,
            line_control: LineControl::default(),
            errors: 0,
            emulate_overrun: false,
            tx_held_by_xoff: false,
            pace_quota: None,
        }
    }

    pub(crate) fn queue_mut(&mut self, kind: Kind) -> &mut RequestQueue {
        match kind {
            Kind::Read => &mut self.read_q,
            Kind::Write => &mut self.write_q,
            Kind::Wait => &mut self.wait_q,
        }
    }
}

/// Both ports of one pair; everything the lock guards
#[derive(Debug)]
pub(crate) struct PairState {
    ports: [PortState; 2],
}

impl PairState {
    pub(crate) fn port(&self, side: Side) -> &PortState {
        match side {
            Side::A => &self.ports[0],
            Side::B => &self.ports[1],
        }
    }

    pub(crate) fn port_mut(&mut self, side: Side) -> &mut PortState {
        match side {
            Side::A => &mut self.ports[0],
            Side::B => &mut self.ports[1],
        }
    }

    /// Mutable access to a port and its peer at once
    pub(crate) fn split(&mut self, side: Side) -> (&mut PortState, &mut PortState) {
        let [a, b] = &mut self.ports;
        match side {
            Side::A => (a, b),
            Side::B => (b, a),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PairInner {
    state: Mutex<PairState>,
    buffer_class: BufferClass,
}

/// The virtual cable: two linked ports created and torn down together
#[derive(Debug)]
pub struct PortPair {
    a: Port,
    b: Port,
}

impl PortPair {
    /// Build a pair whose receive buffers are sized by `class` at open
    pub fn new(class: BufferClass) -> Self {
        let inner = Arc::new(PairInner {
            state: Mutex::new(PairState {
                ports: [PortState::new(), PortState::new()],
            }),
            buffer_class: class,
        });
        Self {
            a: Port {
                inner: inner.clone(),
                side: Side::A,
            },
            b: Port {
                inner,
                side: Side::B,
            },
        }
    }

    /// Handle for the first end
    pub fn port_a(&self) -> Port {
        self.a.clone()
    }

    /// Handle for the second end
    pub fn port_b(&self) -> Port {
        self.b.clone()
    }

    /// Handles for both ends
    pub fn ports(&self) -> (Port, Port) {
        (self.a.clone(), self.b.clone())
    }
}

impl Default for PortPair {
    fn default() -> Self {
        Self::new(BufferClass::default())
    }
}

/// One end of a [`PortPair`]; cheap to clone, safe to use from any thread
#[derive(Debug, Clone)]
pub struct Port {
    inner: Arc<PairInner>,
    side: Side,
}

impl Port {
    /// Run `f` under the pair lock, then deliver collected completions with
    /// the lock released.
    fn with_state<R>(&self, f: impl FnOnce(&mut PairState, &mut Completions) -> R) -> R {
        let mut completions = Completions::new();
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            f(&mut state, &mut completions)
        };
        completions.deliver();
        result
    }

    /// Open the port: allocate its receive buffer and raise its configured
    /// outputs. A second open fails with [`Error::PortBusy`].
    pub fn open(&self) -> Result<(), Error> {
        self.with_state(|state, completions| {
            let size = {
                let port = state.port_mut(self.side);
                if port.open {
                    return Err(Error::PortBusy);
                }
                port.open = true;
                port.wait_mask = 0;
                port.events = 0;
                port.errors = 0;
                port.tx_held_by_xoff = false;
                match port.handflow.rts {
                    RtsMode::Enabled => port.pins |= pin::RTS,
                    RtsMode::Disabled => port.pins &= !pin::RTS,
                    RtsMode::Handshake => {}
                }
                match port.handflow.dtr {
                    DtrMode::Enabled => port.pins |= pin::DTR,
                    DtrMode::Disabled => port.pins &= !pin::DTR,
                    DtrMode::Handshake => {}
                }
                self.inner.buffer_class.size()
            };
            state.port_mut(self.side).buffer = RingBuffer::new(size);
            tracing::debug!(port = self.side.label(), size, "port open");
            io::update_hand_flow(state, self.side, completions);
            Ok(())
        })
    }

    /// Close the port: cancel every pending request, drop the outputs the
    /// peer sees and release the receive buffer.
    pub fn close(&self) -> Result<(), Error> {
        self.with_state(|state, completions| {
            let port = state.port_mut(self.side);
            if !port.open {
                return Err(Error::NotOpen);
            }
            port.read_q.cancel_all(completions);
            port.write_q.cancel_all(completions);
            port.wait_q.cancel_all(completions);
            port.open = false;
            port.buffer = RingBuffer::new(0);
            port.above_watermark = false;
            tracing::debug!(port = self.side.label(), "port close");
            io::update_hand_flow(state, self.side, completions);
            Ok(())
        })
    }

    fn start(&self, kind: Kind, payload: Payload) -> Result<Operation, Error> {
        let request = Request::new(payload);
        self.with_state(|state, completions| {
            if !state.port(self.side).open {
                return Err(Error::NotOpen);
            }
            io::start_request(state, self.side, kind, request.clone(), completions)
        })?;
        Ok(Operation {
            inner: self.inner.clone(),
            side: self.side,
            kind,
            request,
        })
    }

    /// Submit a read for up to `len` bytes; completes when the destination
    /// is full, or early with partial data through cancel/timeout.
    pub fn start_read(&self, len: usize) -> Result<Operation, Error> {
        if len == 0 {
            return Err(Error::InvalidParameter);
        }
        self.start(
            Kind::Read,
            Payload::Read {
                dest: vec![0; len],
                pos: 0,
            },
        )
    }

    /// Submit a write of `data`; completes when the peer has accepted every
    /// byte.
    pub fn start_write(&self, data: Vec<u8>) -> Result<Operation, Error> {
        if data.is_empty() {
            return Err(Error::InvalidParameter);
        }
        self.start(Kind::Write, Payload::Write { src: data, pos: 0 })
    }

    /// Submit a wait for the current wait mask. At most one may be
    /// outstanding per port; a second fails with
    /// [`Error::InvalidParameter`].
    pub fn start_wait(&self) -> Result<Operation, Error> {
        self.start(Kind::Wait, Payload::Wait)
    }

    /// Blocking read. Returns the number of bytes placed into `buf`; a
    /// timeout with partial data reports the short count instead of failing.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let op = self.start_read(buf.len())?;
        let outcome = op.block(timeout);
        let data = op.take_read_data();
        buf[..data.len()].copy_from_slice(&data);
        match outcome.status {
            CompletionStatus::Complete => Ok(data.len()),
            CompletionStatus::TimedOut if !data.is_empty() => Ok(data.len()),
            CompletionStatus::TimedOut => Err(Error::Timeout),
            CompletionStatus::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Blocking write. Returns bytes accepted by the peer; a timeout with
    /// partial progress reports the short count.
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let op = self.start_write(data.to_vec())?;
        let outcome = op.block(timeout);
        match outcome.status {
            CompletionStatus::Complete => Ok(outcome.transferred),
            CompletionStatus::TimedOut if outcome.transferred > 0 => Ok(outcome.transferred),
            CompletionStatus::TimedOut => Err(Error::Timeout),
            CompletionStatus::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Blocking wait-for-event; returns the accumulated event bits
    pub fn wait_on_mask(&self, timeout: Option<Duration>) -> Result<u32, Error> {
        let op = self.start_wait()?;
        let outcome = op.block(timeout);
        match outcome.status {
            CompletionStatus::Complete => Ok(outcome.events),
            CompletionStatus::TimedOut => Err(Error::Timeout),
            CompletionStatus::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Replace the wait mask. A pending wait completes immediately with no
    /// events, and previously accumulated events are discarded.
    pub fn set_wait_mask(&self, mask: u32) {
        self.with_state(|state, completions| {
            let port = state.port_mut(self.side);
            if let Some(current) = port.wait_q.current().cloned() {
                if current.claim() {
                    completions.push(
                        current,
                        Outcome {
                            status: CompletionStatus::Complete,
                            transferred: 0,
                            events: 0,
                        },
                    );
                }
                port.wait_q.shift();
            }
            port.wait_mask = mask;
            port.events = 0;
        });
    }

    /// Current wait mask
    pub fn wait_mask(&self) -> u32 {
        self.with_state(|state, _| state.port(self.side).wait_mask)
    }

    /// Install new handshake settings. Enable/disable line modes take
    /// effect on the pins immediately; a release of an out-flow hold retries
    /// pending transfers.
    pub fn set_handflow(&self, handflow: Handflow) {
        self.with_state(|state, completions| {
            let port = state.port_mut(self.side);
            port.handflow = handflow;
            match handflow.rts {
                RtsMode::Enabled => port.pins |= pin::RTS,
                RtsMode::Disabled => port.pins &= !pin::RTS,
                RtsMode::Handshake => {}
            }
            match handflow.dtr {
                DtrMode::Enabled => port.pins |= pin::DTR,
                DtrMode::Disabled => port.pins &= !pin::DTR,
                DtrMode::Handshake => {}
            }
            io::update_hand_flow(state, self.side, completions);
        });
    }

    /// Current handshake settings
    pub fn handflow(&self) -> Handflow {
        self.with_state(|state, _| state.port(self.side).handflow)
    }

    /// Replace the XON/XOFF and event characters
    pub fn set_special_chars(&self, chars: SpecialChars) {
        self.with_state(|state, _| state.port_mut(self.side).special_chars = chars);
    }

    /// Current XON/XOFF and event characters
    pub fn special_chars(&self) -> SpecialChars {
        self.with_state(|state, _| state.port(self.side).special_chars)
    }

    /// Enable or disable escape injection. With `Some(esc)`, data bytes
    /// equal to `esc` are doubled on the wire and the selected status
    /// classes are multiplexed into the receive stream.
    pub fn set_escape_mode(&self, escape_char: Option<u8>, options: InsertOptions) {
        self.with_state(|state, _| {
            let port = state.port_mut(self.side);
            port.escape_char = escape_char;
            port.insert_opts = options;
        });
    }

    /// Current baud rate
    pub fn baud_rate(&self) -> u32 {
        self.with_state(|state, _| state.port(self.side).baud_rate)
    }

    /// Set the port's baud rate; the peer learns of it through a
    /// remote-baud-rate escape sequence when it asked for them.
    pub fn set_baud_rate(&self, baud: u32) -> Result<(), Error> {
        if baud == 0 {
            return Err(Error::InvalidParameter);
        }
        self.with_state(|state, completions| {
            state.port_mut(self.side).baud_rate = baud;
            io::announce_baud_rate(state, self.side, completions);
            Ok(())
        })
    }

    /// Current line-control settings
    pub fn line_control(&self) -> LineControl {
        self.with_state(|state, _| state.port(self.side).line_control)
    }

    /// Set word length, parity and stop bits; announced to the peer like
    /// [`set_baud_rate`](Self::set_baud_rate).
    pub fn set_line_control(&self, line_control: LineControl) {
        self.with_state(|state, completions| {
            state.port_mut(self.side).line_control = line_control;
            io::announce_line_control(state, self.side, completions);
        });
    }

    /// Change pin outputs under `mask`. RTS and DTR are rejected while the
    /// corresponding line is in handshake mode.
    pub fn set_pins(&self, values: u8, mask: u8) -> Result<(), Error> {
        self.with_state(|state, completions| {
            let port = state.port_mut(self.side);
            if mask & pin::RTS != 0 && port.handflow.rts == RtsMode::Handshake {
                return Err(Error::InvalidParameter);
            }
            if mask & pin::DTR != 0 && port.handflow.dtr == DtrMode::Handshake {
                return Err(Error::InvalidParameter);
            }
            port.pins = (port.pins & !mask) | (values & mask);
            io::update_hand_flow(state, self.side, completions);
            Ok(())
        })
    }

    /// Current pin outputs (`pin::*` bits)
    pub fn pins(&self) -> u8 {
        self.with_state(|state, _| state.port(self.side).pins)
    }

    /// Current modem-status inputs (`msr::*` bits), as driven by the peer
    pub fn modem_status(&self) -> u8 {
        self.with_state(|state, _| state.port(self.side).modem_status)
    }

    /// Abort pending requests and/or discard buffered receive data
    pub fn purge(&self, flags: u8) {
        self.with_state(|state, completions| {
            {
                let port = state.port_mut(self.side);
                if flags & purge::RX_ABORT != 0 {
                    port.read_q.cancel_all(completions);
                }
                if flags & purge::TX_ABORT != 0 {
                    port.write_q.cancel_all(completions);
                }
                if flags & purge::RX_CLEAR != 0 {
                    port.buffer.purge();
                }
            }
            if flags & purge::RX_CLEAR != 0 {
                // Freed room may release the peer's held writes.
                io::service_pair(state, completions);
            }
        });
    }

    /// Buffer occupancy on both directions of this port
    pub fn queue_status(&self) -> QueueStatus {
        self.with_state(|state, _| {
            let port = state.port(self.side);
            let tx_queued = port
                .write_q
                .iter()
                .map(|request| {
                    let body = request.body.lock().unwrap();
                    match &body.payload {
                        Payload::Write { src, pos } => src.len() - pos,
                        _ => 0,
                    }
                })
                .sum();
            QueueStatus {
                rx_queued: port.buffer.pending_bytes(),
                tx_queued,
            }
        })
    }

    /// Grow the receive buffer; a size not larger than the current one is a
    /// no-op.
    pub fn set_queue_size(&self, size: usize) {
        self.with_state(|state, completions| {
            if state.port_mut(self.side).buffer.grow(size) {
                io::service_pair(state, completions);
            }
        });
    }

    /// Accumulated error bits (`lsr::*`), cleared by reading
    pub fn errors(&self) -> u32 {
        self.with_state(|state, _| {
            let port = state.port_mut(self.side);
            std::mem::take(&mut port.errors)
        })
    }

    /// When enabled, bytes the receive buffer cannot hold are discarded and
    /// flagged as overruns instead of back-pressuring the writer.
    pub fn set_overrun_emulation(&self, enabled: bool) {
        self.with_state(|state, completions| {
            state.port_mut(self.side).emulate_overrun = enabled;
            io::service_pair(state, completions);
        });
    }

    /// Toggle artificial write pacing. While enabled, writes only progress
    /// as [`pace_tick`](Self::pace_tick) grants quota.
    pub fn set_pacing(&self, enabled: bool) {
        self.with_state(|state, completions| {
            state.port_mut(self.side).pace_quota = if enabled { Some(0) } else { None };
            if !enabled {
                io::service_pair(state, completions);
            }
        });
    }

    /// Grant `bytes` of pacing quota and retry held writes; the pacing
    /// timer collaborator calls this.
    pub fn pace_tick(&self, bytes: usize) {
        self.with_state(|state, completions| {
            let port = state.port_mut(self.side);
            let granted = match port.pace_quota.as_mut() {
                Some(quota) => {
                    *quota += bytes;
                    true
                }
                None => false,
            };
            if granted {
                io::service_pair(state, completions);
            }
        });
    }

    /// Hold this port's transmit path as if the peer had sent XOFF
    pub fn xoff(&self) {
        self.with_state(|state, _| state.port_mut(self.side).tx_held_by_xoff = true);
    }

    /// Release a transmit hold and retry pending writes
    pub fn xon(&self) {
        self.with_state(|state, completions| {
            state.port_mut(self.side).tx_held_by_xoff = false;
            io::service_pair(state, completions);
        });
    }
}

/// Handle to one submitted operation
#[derive(Debug)]
pub struct Operation {
    inner: Arc<PairInner>,
    side: Side,
    kind: Kind,
    request: Arc<Request>,
}

impl Operation {
    /// Block until the operation completes
    pub fn wait(&self) -> Outcome {
        self.request.wait_outcome()
    }

    /// Block with a deadline; on expiry the request is claimed through the
    /// cancellation path with a [`CompletionStatus::TimedOut`] outcome
    /// carrying the partial transfer count. If natural completion wins the
    /// race, its outcome is returned instead.
    pub fn wait_deadline(&self, timeout: Duration) -> Outcome {
        let deadline = Instant::now() + timeout;
        if let Some(outcome) = self.request.wait_outcome_until(deadline) {
            return outcome;
        }
        self.cancel_with(CompletionStatus::TimedOut);
        self.request.wait_outcome()
    }

    fn block(&self, timeout: Option<Duration>) -> Outcome {
        match timeout {
            Some(timeout) => self.wait_deadline(timeout),
            None => self.wait(),
        }
    }

    /// The outcome, if the operation has already completed
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.request.try_outcome()
    }

    /// Cancel the operation. Idempotent; a request already claimed by
    /// normal completion is left untouched.
    pub fn cancel(&self) {
        self.cancel_with(CompletionStatus::Cancelled);
    }

    fn cancel_with(&self, status: CompletionStatus) {
        let mut completions = Completions::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            io::cancel_request(
                &mut state,
                self.side,
                self.kind,
                &self.request,
                status,
                &mut completions,
            );
        }
        completions.deliver();
    }

    /// Take the bytes a completed read produced. Call after the outcome is
    /// known; the data can only be taken once.
    pub fn take_read_data(&self) -> Vec<u8> {
        let mut body = self.request.body.lock().unwrap();
        match &mut body.payload {
            Payload::Read { dest, pos } => {
                let mut data = std::mem::take(dest);
                data.truncate(*pos);
                *pos = 0;
                data
            }
            _ => Vec::new(),
        }
    }
}
