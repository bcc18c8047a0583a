use std::time::Duration;

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, SymbolSizeTypeTcc, SymbolTypeTcc, TransportLayerCc,
    MAX_RUN_LENGTH, ONE_BIT_VECTOR_CAPACITY, TYPE_TCC_DELTA_SCALE_FACTOR,
};

/// Most received packets a single feedback describes, so one always fits in an
/// RTCP datagram.
const MAX_RECEIVED_PER_FEEDBACK: usize = 256;
const REFERENCE_TIME_UNIT_US: i64 = 64000;
const REFERENCE_TIME_MASK: i64 = 0xFFFFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Arrival {
    seqnum: u16,
    arrival_us: i64,
}

/// TwccEncoder records arrivals of packets carrying a transport-wide sequence
/// number and turns them into feedback.
#[derive(Debug, Default)]
pub(crate) struct TwccEncoder {
    arrivals: Vec<Arrival>,
    batch_start: Option<Duration>,
    media_ssrc: u32,
    fb_pkt_count: u8,
    /// Highest sequence number an emitted feedback covered.
    last_covered: Option<u16>,
    feedback_interval: Option<Duration>,
}

impl TwccEncoder {
    pub(crate) fn new(feedback_interval: Option<Duration>) -> Self {
        TwccEncoder {
            feedback_interval,
            ..Default::default()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    /// When the current batch is due without a marker bit.
    pub(crate) fn due_at(&self) -> Option<Duration> {
        Some(self.batch_start? + self.feedback_interval?)
    }

    /// record logs one arrival. Returns true when the batch should be finalized
    /// now, on a marker bit or once the feedback interval elapsed.
    pub(crate) fn record(
        &mut self,
        media_ssrc: u32,
        seqnum: u16,
        arrival: Duration,
        marker: bool,
    ) -> bool {
        if let Some(last) = self.last_covered {
            if (seqnum.wrapping_sub(last) as i16) <= 0 {
                log::trace!("twcc seq {seqnum} already reported, dropped");
                return false;
            }
        }
        if self.arrivals.iter().any(|a| a.seqnum == seqnum) {
            log::trace!("duplicate twcc seq {seqnum} dropped");
            return false;
        }

        self.media_ssrc = media_ssrc;
        self.batch_start.get_or_insert(arrival);
        self.arrivals.push(Arrival {
            seqnum,
            arrival_us: arrival.as_micros() as i64,
        });

        marker || self.due_at().map_or(false, |due| arrival >= due)
    }

    /// build_feedback finalizes the batch into one or more feedback packets.
    pub(crate) fn build_feedback(&mut self, sender_ssrc: u32) -> Vec<TransportLayerCc> {
        let mut arrivals = std::mem::take(&mut self.arrivals);
        self.batch_start = None;
        let first_seq = match arrivals.first() {
            Some(a) => a.seqnum,
            None => return vec![],
        };
        arrivals.sort_by_key(|a| a.seqnum.wrapping_sub(first_seq) as i16);

        let mut out = vec![];
        let mut feedback = FeedbackBuilder::new(arrivals[0]);
        for a in &arrivals {
            if !feedback.add(*a) {
                out.push(feedback.finish(sender_ssrc, self.media_ssrc, self.next_fb_count()));
                feedback = FeedbackBuilder::new(*a);
                feedback.add(*a);
            }
        }
        out.push(feedback.finish(sender_ssrc, self.media_ssrc, self.next_fb_count()));

        self.last_covered = arrivals.last().map(|a| a.seqnum);
        out
    }

    fn next_fb_count(&mut self) -> u8 {
        let count = self.fb_pkt_count;
        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);
        count
    }
}

struct FeedbackBuilder {
    base_sequence_number: u16,
    reference_time: i64,
    next_sequence_number: u16,
    last_units: i64,
    received: usize,
    symbols: Vec<SymbolTypeTcc>,
    deltas: Vec<RecvDelta>,
}

impl FeedbackBuilder {
    fn new(first: Arrival) -> Self {
        let reference_time = first.arrival_us / REFERENCE_TIME_UNIT_US;
        FeedbackBuilder {
            base_sequence_number: first.seqnum,
            reference_time,
            next_sequence_number: first.seqnum,
            last_units: reference_time * REFERENCE_TIME_UNIT_US / TYPE_TCC_DELTA_SCALE_FACTOR,
            received: 0,
            symbols: vec![],
            deltas: vec![],
        }
    }

    /// Adds a received packet, or returns false when it needs a new feedback.
    fn add(&mut self, a: Arrival) -> bool {
        let units = a.arrival_us / TYPE_TCC_DELTA_SCALE_FACTOR;
        let delta = units - self.last_units;
        if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
            return false;
        }
        if self.received == MAX_RECEIVED_PER_FEEDBACK {
            return false;
        }
        let gap = a.seqnum.wrapping_sub(self.next_sequence_number) as usize;
        if self.symbols.len() + gap + 1 > u16::MAX as usize {
            return false;
        }

        self.symbols
            .extend(std::iter::repeat(SymbolTypeTcc::PacketNotReceived).take(gap));
        let symbol = if (0..=u8::MAX as i64).contains(&delta) {
            SymbolTypeTcc::PacketReceivedSmallDelta
        } else {
            SymbolTypeTcc::PacketReceivedLargeDelta
        };
        self.symbols.push(symbol);
        self.deltas.push(RecvDelta {
            type_tcc_packet: symbol,
            delta: delta * TYPE_TCC_DELTA_SCALE_FACTOR,
        });
        self.last_units = units;
        self.received += 1;
        self.next_sequence_number = a.seqnum.wrapping_add(1);
        true
    }

    fn finish(self, sender_ssrc: u32, media_ssrc: u32, fb_pkt_count: u8) -> TransportLayerCc {
        TransportLayerCc {
            sender_ssrc,
            media_ssrc,
            base_sequence_number: self.base_sequence_number,
            packet_status_count: self.symbols.len() as u16,
            reference_time: (self.reference_time & REFERENCE_TIME_MASK) as u32,
            fb_pkt_count,
            packet_chunks: encode_chunks(&self.symbols),
            recv_deltas: self.deltas,
        }
    }
}

/// Symbol size for a status vector starting at `rest`: one bit unless a
/// packet in the next one-bit window needs a large or negative delta.
fn window_symbol_size(rest: &[SymbolTypeTcc]) -> SymbolSizeTypeTcc {
    if rest
        .iter()
        .take(ONE_BIT_VECTOR_CAPACITY)
        .any(|s| *s == SymbolTypeTcc::PacketReceivedLargeDelta)
    {
        SymbolSizeTypeTcc::TwoBit
    } else {
        SymbolSizeTypeTcc::OneBit
    }
}

fn push_run_length(chunks: &mut Vec<PacketStatusChunk>, symbol: SymbolTypeTcc, mut run: usize) {
    while run > 0 {
        let run_length = run.min(MAX_RUN_LENGTH as usize);
        chunks.push(PacketStatusChunk::RunLength {
            symbol,
            run_length: run_length as u16,
        });
        run -= run_length;
    }
}

/// The status vector being filled.
#[derive(Default)]
struct VectorWriter {
    symbol_size: SymbolSizeTypeTcc,
    symbols: Vec<SymbolTypeTcc>,
}

impl VectorWriter {
    fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn available(&self) -> usize {
        self.symbol_size.capacity() - self.symbols.len()
    }

    /// Writes `symbol`, the first of `rest`. An empty vector picks its symbol
    /// size from `rest`; a full one is flushed.
    fn write(
        &mut self,
        chunks: &mut Vec<PacketStatusChunk>,
        symbol: SymbolTypeTcc,
        rest: &[SymbolTypeTcc],
    ) {
        if self.symbols.is_empty() {
            self.symbol_size = window_symbol_size(rest);
        }
        self.symbols.push(symbol);
        if self.available() == 0 {
            self.flush(chunks);
        }
    }

    /// Writes a gap of `count` lost packets starting at `rest`.
    fn write_gap(
        &mut self,
        chunks: &mut Vec<PacketStatusChunk>,
        count: usize,
        rest: &[SymbolTypeTcc],
    ) {
        if self.is_empty() {
            self.symbol_size = window_symbol_size(rest);
        }
        let available = self.available();
        let capacity = self.symbol_size.capacity();
        if !self.is_empty() && count > available + capacity {
            for i in 0..available {
                self.write(chunks, SymbolTypeTcc::PacketNotReceived, &rest[i..]);
            }
            push_run_length(chunks, SymbolTypeTcc::PacketNotReceived, count - available);
        } else {
            for i in 0..count {
                self.write(chunks, SymbolTypeTcc::PacketNotReceived, &rest[i..]);
            }
        }
    }

    fn flush(&mut self, chunks: &mut Vec<PacketStatusChunk>) {
        if self.symbols.is_empty() {
            return;
        }
        chunks.push(PacketStatusChunk::StatusVector {
            symbol_size: self.symbol_size,
            symbols: std::mem::take(&mut self.symbols),
        });
    }
}

/// Greedy chunk selection. Each received packet is written together with the
/// gap of lost packets before it. Run-length chunks only start at a chunk
/// boundary; status vectors pick their symbol size per window.
pub(crate) fn encode_chunks(symbols: &[SymbolTypeTcc]) -> Vec<PacketStatusChunk> {
    let mut chunks = vec![];
    let mut vector = VectorWriter::default();
    let mut pos = 0;
    while pos < symbols.len() {
        let mut gap = symbols[pos..]
            .iter()
            .take_while(|s| **s == SymbolTypeTcc::PacketNotReceived)
            .count();
        let at = pos + gap;

        if vector.is_empty() {
            let capacity = window_symbol_size(&symbols[pos..]).capacity();
            if gap > capacity || (gap > 0 && at == symbols.len()) {
                push_run_length(&mut chunks, SymbolTypeTcc::PacketNotReceived, gap);
                gap = 0;
            }
            if gap == 0 && at < symbols.len() {
                let symbol = symbols[at];
                let capacity = window_symbol_size(&symbols[at..]).capacity();
                let equal = symbols[at..].iter().take_while(|s| **s == symbol).count();
                let remaining = symbols[at..]
                    .iter()
                    .filter(|s| **s != SymbolTypeTcc::PacketNotReceived)
                    .count();
                if equal >= capacity
                    || (equal > 1 && remaining > ONE_BIT_VECTOR_CAPACITY)
                    || equal == remaining
                {
                    push_run_length(&mut chunks, symbol, equal);
                    pos = at + equal;
                    continue;
                }
            }
        }

        if gap > 0 {
            vector.write_gap(&mut chunks, gap, &symbols[pos..]);
        }
        if at == symbols.len() {
            break;
        }
        vector.write(&mut chunks, symbols[at], &symbols[at..]);
        pos = at + 1;
    }
    vector.flush(&mut chunks);

    chunks
}
