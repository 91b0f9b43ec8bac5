use std::cmp;
use std::collections::BinaryHeap;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use super::assembler::Assembler;
use super::send_buffer::SendBuffer;
use super::spaces::Retransmits;
use crate::frame::{self, FrameStruct, StreamMeta, StreamMetaVec};
use crate::transport_error::TransportError;
use crate::transport_parameters::TransportParameters;
use crate::{Dir, Side, StreamId, VarInt};

/// The stream table and everything needed to multiplex it fairly
pub(super) struct StreamsState {
    side: Side,
    pub(super) streams: FxHashMap<StreamId, Stream>,
    /// Next index for locally initiated streams, per directionality
    next: [u64; 2],
    /// Peer-imposed limit on locally initiated stream counts
    max: [u64; 2],
    /// Lowest remote index not yet opened
    next_remote: [u64; 2],
    /// Limit we advertised on remotely initiated stream counts
    pub(super) max_remote: [u64; 2],
    /// Limit most recently announced with MAX_STREAMS
    pub(super) sent_max_remote: [u64; 2],
    /// Initial receive-side flow control credit for every new stream
    stream_receive_window: u64,
    /// Send-side windows granted by the peer's transport parameters
    send_window_local_bidi: u64,
    send_window_remote_bidi: u64,
    send_window_uni: u64,
    /// Streams with outbound data, cheapest round-robin cycle first
    schedule: BinaryHeap<ScheduleEntry>,
    scheduled: FxHashSet<StreamId>,
}

impl StreamsState {
    pub(super) fn new(
        side: Side,
        stream_receive_window: u64,
        max_remote_bidi: u64,
        max_remote_uni: u64,
    ) -> Self {
        Self {
            side,
            streams: FxHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            next_remote: [0, 0],
            max_remote: [max_remote_bidi, max_remote_uni],
            sent_max_remote: [max_remote_bidi, max_remote_uni],
            stream_receive_window,
            send_window_local_bidi: 0,
            send_window_remote_bidi: 0,
            send_window_uni: 0,
            schedule: BinaryHeap::new(),
            scheduled: FxHashSet::default(),
        }
    }

    /// Fold in the peer's transport parameters, raising limits for streams
    /// opened before they arrived
    pub(super) fn set_params(&mut self, params: &TransportParameters) {
        self.max[Dir::Bi as usize] = params.initial_max_streams_bidi.into_inner();
        self.max[Dir::Uni as usize] = params.initial_max_streams_uni.into_inner();
        self.send_window_local_bidi = params.initial_max_stream_data_bidi_remote.into_inner();
        self.send_window_remote_bidi = params.initial_max_stream_data_bidi_local.into_inner();
        self.send_window_uni = params.initial_max_stream_data_uni.into_inner();
        let side = self.side;
        let windows = [
            self.send_window_local_bidi,
            self.send_window_remote_bidi,
            self.send_window_uni,
        ];
        for (&id, stream) in &mut self.streams {
            if let Some(send) = stream.send.as_mut() {
                let window = match (id.dir(), id.initiator() == side) {
                    (Dir::Bi, true) => windows[0],
                    (Dir::Bi, false) => windows[1],
                    (Dir::Uni, _) => windows[2],
                };
                send.max_data = cmp::max(send.max_data, window);
            }
        }
    }

    fn initial_send_window_for(&self, id: StreamId) -> u64 {
        match (id.dir(), id.initiator() == self.side) {
            (Dir::Bi, true) => self.send_window_local_bidi,
            (Dir::Bi, false) => self.send_window_remote_bidi,
            (Dir::Uni, _) => self.send_window_uni,
        }
    }

    /// Allocate the next locally initiated stream id
    pub(super) fn open(&mut self, dir: Dir, user: u64) -> Option<StreamId> {
        if self.next[dir as usize] >= self.max[dir as usize] {
            return None;
        }
        let id = StreamId::new(self.side, dir, self.next[dir as usize]);
        self.next[dir as usize] += 1;
        let send = SendHalf::new(self.initial_send_window_for(id));
        let recv = (dir == Dir::Bi).then(|| RecvHalf::new(self.stream_receive_window));
        self.streams.insert(
            id,
            Stream {
                cycle: 0,
                user,
                send: Some(send),
                recv,
            },
        );
        Some(id)
    }

    /// Index the peer may open up to, for STREAMS_BLOCKED hints
    pub(super) fn local_limit(&self, dir: Dir) -> u64 {
        self.max[dir as usize]
    }

    /// Raise the peer-imposed limit on locally initiated streams
    pub(super) fn recv_max_streams(&mut self, dir: Dir, count: u64) -> bool {
        if count <= self.max[dir as usize] {
            return false;
        }
        self.max[dir as usize] = count;
        true
    }

    /// Validate a frame's stream id and lazily open remote streams up to it
    ///
    /// Returns ids freshly opened by this frame, lowest first.
    fn validate_receivable(
        &mut self,
        id: StreamId,
        opened: &mut Vec<StreamId>,
    ) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            if id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received frame for send-only stream",
                ));
            }
            if id.index() >= self.next[Dir::Bi as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received frame for unopened local stream",
                ));
            }
            return Ok(());
        }
        let dir = id.dir();
        if id.index() >= self.max_remote[dir as usize] {
            return Err(TransportError::STREAM_LIMIT_ERROR(""));
        }
        let next = &mut self.next_remote[dir as usize];
        while *next <= id.index() {
            let new_id = StreamId::new(!self.side, dir, *next);
            *next += 1;
            let send = (dir == Dir::Bi).then(|| SendHalf::new(self.send_window_remote_bidi));
            self.streams.insert(
                new_id,
                Stream {
                    cycle: 0,
                    user: 0,
                    send,
                    recv: Some(RecvHalf::new(self.stream_receive_window)),
                },
            );
            opened.push(new_id);
        }
        Ok(())
    }

    /// Process an inbound STREAM frame
    ///
    /// `conn_credit_left` is the connection-level receive window remaining;
    /// stream-level flow control is checked first, then the new bytes are
    /// charged against the connection.
    pub(super) fn recv_stream(
        &mut self,
        frame: frame::Stream,
        conn_credit_left: u64,
    ) -> Result<RecvOutcome, TransportError> {
        let mut outcome = RecvOutcome::default();
        self.validate_receivable(frame.id, &mut outcome.opened)?;
        let Some(stream) = self.streams.get_mut(&frame.id) else {
            // Stale retransmission for a stream that already finished
            return Ok(outcome);
        };
        let rx = stream
            .recv
            .as_mut()
            .expect("validated streams have a receive half");

        let end = frame.offset + frame.data.len() as u64;
        if end > rx.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR("stream limit exceeded"));
        }
        if let Some(final_offset) = rx.final_offset {
            if end > final_offset || (frame.fin && end != final_offset) {
                return Err(TransportError::FINAL_SIZE_ERROR("final size changed"));
            }
        }
        if frame.fin && end < rx.last_offset {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "final size below received data",
            ));
        }

        let new_bytes = end.saturating_sub(rx.last_offset);
        if new_bytes > conn_credit_left {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection limit exceeded",
            ));
        }
        outcome.new_bytes = new_bytes;
        rx.last_offset = cmp::max(rx.last_offset, end);
        if frame.fin {
            rx.final_offset = Some(end);
        }

        if rx.reset_received || rx.stopped.is_some() {
            // Flow accounting above still applies, but the data is dropped
            return Ok(outcome);
        }
        rx.assembler.insert(frame.offset, frame.data);

        while let Some(chunk) = rx.assembler.read() {
            let fin = rx.final_offset == Some(chunk.offset + chunk.bytes.len() as u64);
            if fin {
                rx.fin_delivered = true;
            }
            outcome.deliveries.push((chunk.offset, chunk.bytes, fin));
        }
        // A FIN at the current read offset arrives with no data to carry it
        if !rx.fin_delivered && rx.final_offset == Some(rx.assembler.bytes_read()) {
            rx.fin_delivered = true;
            outcome
                .deliveries
                .push((rx.assembler.bytes_read(), Bytes::new(), true));
        }

        outcome.closed = self.cleanup(frame.id);
        Ok(outcome)
    }

    /// Process an inbound RESET_STREAM frame
    pub(super) fn recv_reset(
        &mut self,
        frame: frame::ResetStream,
        conn_credit_left: u64,
    ) -> Result<ResetOutcome, TransportError> {
        let mut outcome = ResetOutcome::default();
        self.validate_receivable(frame.id, &mut outcome.opened)?;
        let Some(stream) = self.streams.get_mut(&frame.id) else {
            return Ok(outcome);
        };
        let rx = stream
            .recv
            .as_mut()
            .expect("validated streams have a receive half");

        let final_size = frame.final_offset.into_inner();
        if final_size < rx.last_offset {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "final size below received data",
            ));
        }
        if rx.final_offset.is_some_and(|x| x != final_size) {
            return Err(TransportError::FINAL_SIZE_ERROR("final size changed"));
        }
        if final_size > rx.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR("stream limit exceeded"));
        }
        // Credit the bytes the peer claims to have sent but we never saw
        let new_bytes = final_size - rx.last_offset;
        if new_bytes > conn_credit_left {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection limit exceeded",
            ));
        }

        let already_reset = std::mem::replace(&mut rx.reset_received, true);
        rx.final_offset = Some(final_size);
        rx.last_offset = final_size;
        rx.assembler.clear();

        if !already_reset {
            outcome.new_bytes = new_bytes;
            outcome.reset = Some((frame.id, final_size, frame.error_code));
        }
        outcome.closed = self.cleanup(frame.id);
        Ok(outcome)
    }

    /// Process an inbound STOP_SENDING frame
    ///
    /// The caller queues the RESET_STREAM this obliges us to send.
    pub(super) fn recv_stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
    ) -> Result<Option<StreamId>, TransportError> {
        if id.initiator() != self.side {
            if id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "STOP_SENDING for receive-only stream",
                ));
            }
        } else if id.index() >= self.next[id.dir() as usize] {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for unopened stream",
            ));
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(None);
        };
        let Some(send) = stream.send.as_mut() else {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for receive-only stream",
            ));
        };
        if send.stop_received.is_some() || send.reset.is_some() {
            return Ok(None);
        }
        send.stop_received = Some(error_code);
        Ok(Some(id))
    }

    /// Raise a stream's send window; returns the new limit if it grew
    pub(super) fn recv_max_stream_data(&mut self, id: StreamId, offset: u64) -> Option<u64> {
        let stream = self.streams.get_mut(&id)?;
        let send = stream.send.as_mut()?;
        if offset <= send.max_data {
            return None;
        }
        send.max_data = offset;
        if send.buf.has_unsent_data() || send.fin_pending {
            self.schedule(id);
        }
        Some(offset)
    }

    /// Queue application data; returns the number of bytes accepted
    ///
    /// Data beyond the stream's flow control limit is not accepted; the
    /// caller charges accepted bytes against connection-level credit.
    pub(super) fn write(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
        conn_credit_left: u64,
    ) -> Result<WriteOutcome, WriteError> {
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_mut().ok_or(WriteError::UnknownStream)?;
        if send.reset.is_some() || send.fin_offset.is_some() {
            return Err(WriteError::Finished);
        }
        if send.stop_received.is_some() {
            return Err(WriteError::Stopped);
        }

        let stream_credit = send.max_data.saturating_sub(send.buf.offset());
        let credit = cmp::min(stream_credit, conn_credit_left);
        let len = cmp::min(data.len(), credit as usize);
        if len == 0 && !data.is_empty() {
            return Err(WriteError::Blocked {
                conn: conn_credit_left == 0,
                stream_at: send.max_data,
            });
        }
        if len > 0 {
            send.buf.write(Bytes::copy_from_slice(&data[..len]));
        }
        if fin && len == data.len() {
            send.fin_pending = true;
            send.fin_offset = Some(send.buf.offset());
        }
        if send.buf.has_unsent_data() || send.fin_pending {
            self.schedule(id);
        }
        Ok(WriteOutcome {
            written: len,
            fin_queued: fin && len == data.len(),
        })
    }

    /// Abruptly terminate the send half with RESET_STREAM
    pub(super) fn reset(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        pending: &mut Retransmits,
    ) -> Result<(), WriteError> {
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_mut().ok_or(WriteError::UnknownStream)?;
        if send.reset.is_some() {
            return Ok(());
        }
        send.reset = Some(error_code);
        send.fin_pending = false;
        pending.reset_stream.push((id, error_code));
        Ok(())
    }

    /// Ask the peer to stop sending on a receive half
    pub(super) fn stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        pending: &mut Retransmits,
    ) -> Result<(), WriteError> {
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let rx = stream.recv.as_mut().ok_or(WriteError::UnknownStream)?;
        if rx.stopped.is_some() || rx.reset_received {
            return Ok(());
        }
        rx.stopped = Some(error_code);
        rx.assembler.clear();
        pending.stop_sending.push(frame::StopSending { id, error_code });
        Ok(())
    }

    /// The final size to advertise in RESET_STREAM for `id`
    pub(super) fn reset_final_size(&self, id: StreamId) -> Option<(VarInt, u64)> {
        let stream = self.streams.get(&id)?;
        let send = stream.send.as_ref()?;
        Some((send.reset?, send.buf.offset()))
    }

    /// Mark a delivered STREAM frame's range acknowledged
    pub(super) fn ack_stream_frame(&mut self, meta: &StreamMeta) -> Option<ClosedStream> {
        let stream = self.streams.get_mut(&meta.id)?;
        let send = stream.send.as_mut()?;
        send.buf.ack(meta.offsets.clone());
        if meta.fin {
            send.fin_acked = true;
        }
        self.cleanup(meta.id)
    }

    /// The peer acknowledged our RESET_STREAM
    pub(super) fn ack_reset(&mut self, id: StreamId) -> Option<ClosedStream> {
        let stream = self.streams.get_mut(&id)?;
        let send = stream.send.as_mut()?;
        if send.reset.is_some() {
            send.reset_acked = true;
        }
        self.cleanup(id)
    }

    /// A packet carrying this STREAM frame was deemed lost
    pub(super) fn retransmit(&mut self, meta: StreamMeta) {
        let Some(stream) = self.streams.get_mut(&meta.id) else {
            return;
        };
        let Some(send) = stream.send.as_mut() else {
            return;
        };
        if send.reset.is_some() {
            // Reset supersedes data retransmission
            return;
        }
        if !meta.offsets.is_empty() {
            send.buf.retransmit(meta.offsets);
        }
        if meta.fin {
            send.fin_pending = true;
        }
        self.schedule(meta.id);
    }

    /// Write STREAM frames into `buf`, round-robin across ready streams
    ///
    /// Flow control was applied when the data was queued, so everything
    /// buffered is sendable.
    pub(super) fn write_stream_frames(
        &mut self,
        buf: &mut Vec<u8>,
        max_buf_size: usize,
    ) -> StreamMetaVec {
        let mut metas = StreamMetaVec::new();
        while buf.len() + frame::Stream::SIZE_BOUND < max_buf_size {
            let Some(id) = self.pop_scheduled() else {
                break;
            };
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            let Some(send) = stream.send.as_mut() else {
                continue;
            };
            if send.reset.is_some() {
                continue;
            }

            // Reserve the frame type byte and stream id; `poll_transmit`
            // accounts for the offset and length fields itself
            let budget = max_buf_size - buf.len() - 1 - 8;
            let (offsets, encode_length) = send.buf.poll_transmit(budget, send.max_data);

            let fin = send.fin_pending && Some(offsets.end) == send.fin_offset;
            if offsets.is_empty() && !fin {
                // Too little room for this stream's offset encoding; keep it
                // queued for the next packet
                self.schedule(id);
                break;
            }
            if fin {
                send.fin_pending = false;
            }

            let meta = StreamMeta {
                id,
                offsets: offsets.clone(),
                fin,
            };
            trace!(id = %id, off = offsets.start, len = offsets.end - offsets.start, fin, "STREAM");
            meta.encode(encode_length, buf);
            let mut pos = offsets.start;
            while pos < offsets.end {
                let data = send.buf.get(pos..offsets.end);
                debug_assert!(!data.is_empty());
                buf.extend_from_slice(data);
                pos += data.len() as u64;
            }
            metas.push(meta);

            // Fairness: a stream with more to send goes to the back of the
            // current cycle
            if send.buf.has_unsent_data() || send.fin_pending {
                stream.cycle += 1;
                self.schedule(id);
            }
        }
        metas
    }

    /// Whether any scheduled stream might produce a frame
    pub(super) fn can_send(&self) -> bool {
        !self.schedule.is_empty()
    }

    fn pop_scheduled(&mut self) -> Option<StreamId> {
        while let Some(entry) = self.schedule.pop() {
            if self.scheduled.remove(&entry.id) {
                return Some(entry.id);
            }
        }
        None
    }

    pub(super) fn schedule(&mut self, id: StreamId) {
        if !self.scheduled.insert(id) {
            return;
        }
        let cycle = self.streams.get(&id).map_or(0, |s| s.cycle);
        self.schedule.push(ScheduleEntry { cycle, id });
    }

    /// Destroy the stream if it meets the destruction preconditions
    ///
    /// Remote streams release a stream-count credit on destruction.
    fn cleanup(&mut self, id: StreamId) -> Option<ClosedStream> {
        let stream = self.streams.get(&id)?;
        if !stream.is_finished() {
            return None;
        }
        let stream = self.streams.remove(&id).unwrap();
        self.scheduled.remove(&id);
        let error = stream
            .send
            .as_ref()
            .and_then(|s| s.reset.or(s.stop_received));
        if id.initiator() != self.side {
            self.max_remote[id.dir() as usize] += 1;
        }
        Some(ClosedStream { id, error })
    }

    /// Whether `max_remote` outgrew the last announced MAX_STREAMS
    pub(super) fn take_max_streams_update(&mut self, dir: Dir) -> Option<u64> {
        let dir = dir as usize;
        if self.max_remote[dir] > self.sent_max_remote[dir] {
            self.sent_max_remote[dir] = self.max_remote[dir];
            return Some(self.max_remote[dir]);
        }
        None
    }

}

/// Noted when a fully closed stream is discarded
#[derive(Debug, Eq, PartialEq)]
pub(super) struct ClosedStream {
    pub(super) id: StreamId,
    pub(super) error: Option<VarInt>,
}

#[derive(Debug, Default)]
pub(super) struct RecvOutcome {
    /// Bytes to charge against connection-level flow control
    pub(super) new_bytes: u64,
    /// Contiguous data ready for the application, in order
    pub(super) deliveries: Vec<(u64, Bytes, bool)>,
    /// Streams this frame implicitly opened
    pub(super) opened: Vec<StreamId>,
    pub(super) closed: Option<ClosedStream>,
}

#[derive(Debug, Default)]
pub(super) struct ResetOutcome {
    pub(super) new_bytes: u64,
    /// Set when the reset takes effect for the first time
    pub(super) reset: Option<(StreamId, u64, VarInt)>,
    pub(super) opened: Vec<StreamId>,
    pub(super) closed: Option<ClosedStream>,
}

#[derive(Debug, Eq, PartialEq)]
pub(super) struct WriteOutcome {
    pub(super) written: usize,
    pub(super) fin_queued: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub(super) enum WriteError {
    /// No such stream, or the operation targets a missing half
    UnknownStream,
    /// Flow control window exhausted
    Blocked { conn: bool, stream_at: u64 },
    /// The peer sent STOP_SENDING
    Stopped,
    /// FIN or reset already queued
    Finished,
}

pub(super) struct Stream {
    /// Round-robin priority; lower goes first
    pub(super) cycle: u64,
    /// Opaque application handle
    pub(super) user: u64,
    pub(super) send: Option<SendHalf>,
    pub(super) recv: Option<RecvHalf>,
}

impl Stream {
    /// Destruction precondition: both halves fully settled
    fn is_finished(&self) -> bool {
        let send_done = self.send.as_ref().map_or(true, |s| {
            if s.reset.is_some() {
                s.reset_acked
            } else {
                s.fin_offset.is_some() && s.fin_acked && s.buf.is_fully_acked()
            }
        });
        let recv_done = self.recv.as_ref().map_or(true, |r| {
            r.reset_received
                || (r.fin_delivered && r.final_offset == Some(r.assembler.bytes_read()))
                || (r.stopped.is_some() && r.final_offset.is_some())
        });
        send_done && recv_done
    }
}

pub(super) struct SendHalf {
    pub(super) buf: SendBuffer,
    /// Peer-granted flow control limit
    pub(super) max_data: u64,
    /// FIN is queued and not yet sent (or was lost)
    pub(super) fin_pending: bool,
    /// Stream length fixed when the application queued FIN
    pub(super) fin_offset: Option<u64>,
    /// The FIN bit has been acknowledged
    pub(super) fin_acked: bool,
    /// We reset the stream with this code
    pub(super) reset: Option<VarInt>,
    pub(super) reset_acked: bool,
    /// Peer asked us to stop sending
    pub(super) stop_received: Option<VarInt>,
}

impl SendHalf {
    fn new(max_data: u64) -> Self {
        Self {
            buf: SendBuffer::new(),
            max_data,
            fin_pending: false,
            fin_offset: None,
            fin_acked: false,
            reset: None,
            reset_acked: false,
            stop_received: None,
        }
    }
}

pub(super) struct RecvHalf {
    pub(super) assembler: Assembler,
    /// Credit advertised to the peer
    pub(super) max_data: u64,
    /// Credit granted by the application but not yet announced
    pub(super) unsent_max_data: u64,
    /// Highest offset seen, including offsets implied by FIN
    pub(super) last_offset: u64,
    /// Final size established by FIN or RESET_STREAM
    pub(super) final_offset: Option<u64>,
    /// The FIN flag has been passed to the application
    pub(super) fin_delivered: bool,
    /// Peer reset the stream
    pub(super) reset_received: bool,
    /// We sent STOP_SENDING with this code
    pub(super) stopped: Option<VarInt>,
}

impl RecvHalf {
    fn new(window: u64) -> Self {
        Self {
            assembler: Assembler::new(),
            max_data: window,
            unsent_max_data: window,
            last_offset: 0,
            final_offset: None,
            fin_delivered: false,
            reset_received: false,
            stopped: None,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
struct ScheduleEntry {
    cycle: u64,
    id: StreamId,
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // Max-heap; reverse for lowest cycle first, stream id as tiebreak
        self.cycle
            .cmp(&other.cycle)
            .then_with(|| self.id.cmp(&other.id))
            .reverse()
    }
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
