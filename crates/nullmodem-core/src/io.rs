//! Cross-transfer orchestration
//!
//! The engine that links the two ports: a write on one side feeds the
//! peer's ring buffer (or a read parked on the peer, directly), and every
//! state change that could unblock a parked request re-runs the transfer
//! until nothing moves. All functions here run under the pair lock and only
//! collect completions; delivery happens in the callers after unlock.
//!
//! Transfer order within one pass is fixed: buffered ring content drains to
//! the parked reader first, then fresh write data flows through the flow
//! filter, directly into the reader's destination while one is parked and
//! into the ring otherwise. A write that cannot make progress (peer buffer
//! at its limit, transmit held by XOFF or hardware handshake, pacing quota
//! exhausted) stays in service and is retried on peer reads, status changes
//! and pacing ticks.

use std::sync::Arc;

use crate::buffer::RawData;
use crate::error::Error;
use crate::escape;
use crate::flow::{copy_with_escape, FlowFilter, XonXoff};
use crate::port::{event, lsr, msr, pin, DtrMode, PairState, PortState, RtsMode, Side};
use crate::request::{CompletionStatus, Completions, Kind, Outcome, Payload, Request};

/// Register a request with its queue and give it a first service attempt.
///
/// An idle queue takes the request as current and runs the engine, which may
/// complete it synchronously. A busy queue appends to the backlog, except
/// the wait queue: only one wait may be outstanding per port.
pub(crate) fn start_request(
    state: &mut PairState,
    side: Side,
    kind: Kind,
    request: Arc<Request>,
    completions: &mut Completions,
) -> Result<(), Error> {
    let queue = state.port_mut(side).queue_mut(kind);
    if queue.is_busy() {
        if kind == Kind::Wait {
            return Err(Error::InvalidParameter);
        }
        queue.push_backlog(request);
        return Ok(());
    }
    queue.set_current(request);
    match kind {
        Kind::Read | Kind::Write => service_pair(state, completions),
        Kind::Wait => wait_complete(state, side, completions),
    }
    Ok(())
}

/// Claim and complete a request from the cancellation path. Returns false
/// when normal completion won the race; the call is then a no-op.
pub(crate) fn cancel_request(
    state: &mut PairState,
    side: Side,
    kind: Kind,
    request: &Arc<Request>,
    status: CompletionStatus,
    completions: &mut Completions,
) -> bool {
    if !request.claim() {
        return false;
    }
    let (transferred, queued, current) = {
        let body = request.body.lock().unwrap();
        (body.payload.transferred(), body.queued, body.current)
    };
    {
        let queue = state.port_mut(side).queue_mut(kind);
        if queued {
            queue.unlink(request);
        } else if current {
            queue.shift();
        } else {
            // Claim succeeded under the lock, so the request must still be
            // a queue member.
            panic!("cancelled request belongs to no queue");
        }
    }
    if current {
        request.body.lock().unwrap().current = false;
        // The promoted successor, if any, gets serviced right away.
        service_pair(state, completions);
    }
    tracing::debug!(?status, transferred, "request claimed by cancel");
    completions.push(
        request.clone(),
        Outcome {
            status,
            transferred,
            events: 0,
        },
    );
    true
}

/// Run transfers in both directions until neither makes progress
pub(crate) fn service_pair(state: &mut PairState, completions: &mut Completions) {
    loop {
        let a = transfer_pass(state, Side::A, completions);
        let b = transfer_pass(state, Side::B, completions);
        if !a && !b {
            break;
        }
    }
}

/// One transfer pass with `writer` as the sending side. Returns whether any
/// byte moved or any request completed.
fn transfer_pass(state: &mut PairState, writer: Side, completions: &mut Completions) -> bool {
    let reader = writer.peer();
    let mut progress = false;

    progress |= drain_ring_to_reader(state, reader);
    progress |= feed_from_writer(state, writer, completions);
    progress |= complete_read_if_full(state, reader, completions);
    update_watermark(state, reader, completions);

    progress
}

/// Serve ring content (and, once empty, side-channel bytes) to the parked
/// read
fn drain_ring_to_reader(state: &mut PairState, reader: Side) -> bool {
    let port = state.port_mut(reader);
    let Some(request) = port.read_q.current().cloned() else {
        return false;
    };
    let mut body = request.body.lock().unwrap();
    let Payload::Read { dest, pos } = &mut body.payload else {
        panic!("read queue holds a non-read request");
    };
    if *pos >= dest.len() {
        return false;
    }
    let n = port.buffer.read(&mut dest[*pos..]);
    *pos += n;
    n > 0
}

/// Move bytes from the writer's in-service request to the reader, applying
/// the reader's flow filter, and complete the write once fully consumed.
fn feed_from_writer(state: &mut PairState, writer: Side, completions: &mut Completions) -> bool {
    let reader = writer.peer();
    let mut reader_events = 0u32;
    let mut writer_events = 0u32;
    let mut xon_xoff = None;
    let mut completed: Option<(Arc<Request>, usize)> = None;
    let mut progress;

    {
        let (w, r) = state.split(writer);
        let Some(wreq) = w.write_q.current().cloned() else {
            return false;
        };
        if write_held(w) {
            return false;
        }
        let mut wbody = wreq.body.lock().unwrap();
        let Payload::Write { src, pos: wpos } = &mut wbody.payload else {
            panic!("write queue holds a non-write request");
        };
        let quota = w.pace_quota.unwrap_or(usize::MAX);
        let take = (src.len() - *wpos).min(quota);
        let pending = &src[*wpos..*wpos + take];

        let mut filter = FlowFilter::build(r);
        let mut consumed = 0;

        // Direct copy into a parked read bypasses the ring but still owns
        // its escape/side-channel state.
        if let Some(rreq) = r.read_q.current().cloned() {
            let mut rbody = rreq.body.lock().unwrap();
            if let Payload::Read { dest, pos } = &mut rbody.payload {
                if *pos < dest.len() {
                    let (pending_escape, insert_data) = r.buffer.escape_parts();
                    let (produced, used) = copy_with_escape(
                        pending_escape,
                        insert_data,
                        Some(&mut filter),
                        &mut dest[*pos..],
                        pending,
                    );
                    *pos += produced;
                    consumed += used;
                }
            }
        }

        if consumed < take {
            consumed += r.buffer.write(&pending[consumed..], Some(&mut filter));
        }

        if consumed < take && r.emulate_overrun {
            let dropped = take - consumed;
            consumed = take;
            r.errors |= u32::from(lsr::OVERRUN);
            reader_events |= event::ERR;
            tracing::debug!(dropped, "overrun emulation discarded bytes");
            inject_line_status(r, lsr::OVERRUN, None);
        }

        *wpos += consumed;
        let done = *wpos >= src.len();
        drop(wbody);

        if let Some(quota) = w.pace_quota.as_mut() {
            *quota -= consumed;
        }
        progress = consumed > 0;
        reader_events |= filter.events;
        xon_xoff = filter.last_xon_xoff;

        if done && wreq.claim() {
            let transferred = wreq.body.lock().unwrap().payload.transferred();
            completed = Some((wreq, transferred));
        }
    }

    // Apply intercepted software flow control to the reader's own transmit
    // path; service_pair retries it on release.
    match xon_xoff {
        Some(XonXoff::Xoff) => state.port_mut(reader).tx_held_by_xoff = true,
        Some(XonXoff::Xon) => state.port_mut(reader).tx_held_by_xoff = false,
        None => {}
    }

    if let Some((wreq, transferred)) = completed {
        completions.push(
            wreq,
            Outcome {
                status: CompletionStatus::Complete,
                transferred,
                events: 0,
            },
        );
        let queue = &mut state.port_mut(writer).write_q;
        queue.shift();
        if queue.is_empty() {
            writer_events |= event::TXEMPTY;
        }
        progress = true;
    }

    record_events(state, reader, reader_events, completions);
    record_events(state, writer, writer_events, completions);
    progress
}

/// Reasons the writer's transmit path is held
fn write_held(port: &PortState) -> bool {
    if port.tx_held_by_xoff && !port.handflow.xoff_continue {
        return true;
    }
    if port.handflow.cts_out_flow && port.modem_status & msr::CTS == 0 {
        return true;
    }
    if port.handflow.dsr_out_flow && port.modem_status & msr::DSR == 0 {
        return true;
    }
    if port.pins & pin::BREAK != 0 {
        return true;
    }
    port.pace_quota == Some(0)
}

/// Complete the in-service read once its destination is full
fn complete_read_if_full(
    state: &mut PairState,
    reader: Side,
    completions: &mut Completions,
) -> bool {
    let port = state.port_mut(reader);
    let Some(request) = port.read_q.current().cloned() else {
        return false;
    };
    let full = {
        let body = request.body.lock().unwrap();
        match &body.payload {
            Payload::Read { dest, pos } => *pos >= dest.len(),
            _ => panic!("read queue holds a non-read request"),
        }
    };
    if !full {
        return false;
    }
    if request.claim() {
        let transferred = request.body.lock().unwrap().payload.transferred();
        completions.push(
            request,
            Outcome {
                status: CompletionStatus::Complete,
                transferred,
                events: 0,
            },
        );
    }
    port.read_q.shift();
    true
}

/// Track the 80% watermark: fire RX80FULL on the rising edge and drive the
/// RTS/DTR handshake outputs on every crossing.
fn update_watermark(state: &mut PairState, side: Side, completions: &mut Completions) {
    let port = state.port_mut(side);
    let watermark = port.buffer.size80();
    let above = watermark > 0 && port.buffer.busy() >= watermark;
    if above == port.above_watermark {
        return;
    }
    port.above_watermark = above;
    let uses_handshake =
        port.handflow.rts == RtsMode::Handshake || port.handflow.dtr == DtrMode::Handshake;
    if above {
        record_events(state, side, event::RX80FULL, completions);
    }
    if uses_handshake {
        sync_modem_status(state, side, completions);
    }
}

/// Accumulate masked events and complete a pending wait with them
pub(crate) fn record_events(
    state: &mut PairState,
    side: Side,
    bits: u32,
    completions: &mut Completions,
) {
    let port = state.port_mut(side);
    let masked = bits & port.wait_mask;
    if masked == 0 {
        return;
    }
    port.events |= masked;
    wait_complete(state, side, completions);
}

/// Complete the in-service wait request if any events have accumulated
pub(crate) fn wait_complete(state: &mut PairState, side: Side, completions: &mut Completions) {
    let port = state.port_mut(side);
    if port.events == 0 {
        return;
    }
    let Some(request) = port.wait_q.current().cloned() else {
        return;
    };
    if request.claim() {
        let events = std::mem::take(&mut port.events);
        completions.push(
            request,
            Outcome {
                status: CompletionStatus::Complete,
                transferred: 0,
                events,
            },
        );
    }
    port.wait_q.shift();
}

/// Effective RTS output of a port
fn rts_out(port: &PortState) -> bool {
    if !port.open {
        return false;
    }
    match port.handflow.rts {
        RtsMode::Handshake => !port.above_watermark,
        _ => port.pins & pin::RTS != 0,
    }
}

/// Effective DTR output of a port
fn dtr_out(port: &PortState) -> bool {
    if !port.open {
        return false;
    }
    match port.handflow.dtr {
        DtrMode::Handshake => !port.above_watermark,
        _ => port.pins & pin::DTR != 0,
    }
}

/// Recompute `side`'s pin outputs, propagate them to the peer's modem
/// status and retry anything a handshake change may have released.
pub(crate) fn update_hand_flow(state: &mut PairState, side: Side, completions: &mut Completions) {
    sync_modem_status(state, side, completions);
    service_pair(state, completions);
}

/// Cross-wire `side`'s outputs into the peer's modem-status inputs: RTS
/// drives CTS, DTR drives DSR and RLSD, OUT1 drives RING, BREAK is reported
/// as a line-status event.
fn sync_modem_status(state: &mut PairState, side: Side, completions: &mut Completions) {
    let mut peer_events = 0u32;
    {
        let (port, peer) = state.split(side);
        let mut new_msr = 0u8;
        if rts_out(port) {
            new_msr |= msr::CTS;
        }
        if dtr_out(port) {
            new_msr |= msr::DSR | msr::RLSD;
        }
        if port.open && port.pins & pin::OUT1 != 0 {
            new_msr |= msr::RING;
        }

        let changed = peer.modem_status ^ new_msr;
        if changed != 0 {
            peer.modem_status = new_msr;
            if changed & msr::CTS != 0 {
                peer_events |= event::CTS;
            }
            if changed & msr::DSR != 0 {
                peer_events |= event::DSR;
            }
            if changed & msr::RLSD != 0 {
                peer_events |= event::RLSD;
            }
            if changed & msr::RING != 0 {
                peer_events |= event::RING;
            }
            inject_modem_status(peer);
        }

        let break_on = port.open && port.pins & pin::BREAK != 0;
        if break_on != peer.remote_break {
            peer.remote_break = break_on;
            peer_events |= event::BREAK;
            if break_on {
                inject_line_status(peer, lsr::BREAK, None);
            }
        }
    }
    record_events(state, side.peer(), peer_events, completions);
}

/// Tell the peer about a baud-rate change through the escape stream
pub(crate) fn announce_baud_rate(state: &mut PairState, side: Side, completions: &mut Completions) {
    let baud = state.port(side).baud_rate;
    let peer = state.port_mut(side.peer());
    let Some(esc) = peer.escape_char else { return };
    if peer.insert_opts.baud_rate {
        inject(peer, &escape::rbr_seq(esc, baud));
        service_pair(state, completions);
    }
}

/// Tell the peer about a line-control change through the escape stream
pub(crate) fn announce_line_control(
    state: &mut PairState,
    side: Side,
    completions: &mut Completions,
) {
    let lc = state.port(side).line_control;
    let peer = state.port_mut(side.peer());
    let Some(esc) = peer.escape_char else { return };
    if peer.insert_opts.line_control {
        inject(peer, &escape::rlc_seq(esc, lc.word_length, lc.parity, lc.stop_bits));
        service_pair(state, completions);
    }
}

fn inject_modem_status(peer: &mut PortState) {
    let Some(esc) = peer.escape_char else { return };
    if peer.insert_opts.modem_status {
        inject(peer, &escape::mst_seq(esc, peer.modem_status));
    }
}

fn inject_line_status(port: &mut PortState, bits: u8, data: Option<u8>) {
    let Some(esc) = port.escape_char else { return };
    if port.insert_opts.line_status {
        match data {
            Some(data) => inject(port, &escape::lsr_data_seq(esc, bits, data)),
            None => inject(port, &escape::lsr_seq(esc, bits)),
        }
    }
}

/// Inject a status sequence ahead of subsequent ordinary writes. What the
/// ring cannot hold is parked in the bounded side channel; only a side
/// channel already full loses the tail, with a log record.
fn inject(port: &mut PortState, seq: &[u8]) {
    let mut raw = RawData::from_slice(seq);
    if !port.buffer.write_raw_data(&mut raw) {
        let (_, insert_data) = port.buffer.escape_parts();
        if !insert_data.move_from(&mut raw) {
            tracing::warn!(dropped = raw.len(), "status sequence dropped, side channel full");
        }
    }
}
