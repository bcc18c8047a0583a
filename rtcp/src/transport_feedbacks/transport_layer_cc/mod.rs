
use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;
use crate::util::*;

type Result<T> = std::result::Result<T, util::Error>;

/// Receive deltas are expressed in multiples of 250 µs.
/// https://tools.ietf.org/html/draft-holmer-rmcat-transport-wide-cc-extensions-01#section-3.1.5
pub const TYPE_TCC_DELTA_SCALE_FACTOR: i64 = 250;

/// Longest run a run-length chunk can express, 13 bits.
pub const MAX_RUN_LENGTH: u16 = (1 << 13) - 1;
/// Symbols held by a status vector chunk with one-bit symbols.
pub const ONE_BIT_VECTOR_CAPACITY: usize = 14;
/// Symbols held by a status vector chunk with two-bit symbols.
pub const TWO_BIT_VECTOR_CAPACITY: usize = 7;

const PACKET_STATUS_CHUNK_LENGTH: usize = 2;
/// base seq, status count, reference time and fb count
const FCI_HEADER_LENGTH: usize = 8;
const PACKET_CHUNK_OFFSET: usize = HEADER_LENGTH + SSRC_LENGTH * 2 + FCI_HEADER_LENGTH;

/// Status of one packet in the feedback.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u16)]
pub enum SymbolTypeTcc {
    #[default]
    PacketNotReceived = 0,
    /// Received, delta fits one unsigned byte.
    PacketReceivedSmallDelta = 1,
    /// Received, delta needs two signed bytes.
    PacketReceivedLargeDelta = 2,
    /// Reserved value, treated as received without a delta.
    PacketReceivedWithoutDelta = 3,
}

impl From<u16> for SymbolTypeTcc {
    fn from(val: u16) -> Self {
        match val {
            0 => SymbolTypeTcc::PacketNotReceived,
            1 => SymbolTypeTcc::PacketReceivedSmallDelta,
            2 => SymbolTypeTcc::PacketReceivedLargeDelta,
            _ => SymbolTypeTcc::PacketReceivedWithoutDelta,
        }
    }
}

impl SymbolTypeTcc {
    pub fn is_received(&self) -> bool {
        *self != SymbolTypeTcc::PacketNotReceived
    }

    /// Number of receive delta octets this symbol carries.
    pub fn delta_size(&self) -> usize {
        match self {
            SymbolTypeTcc::PacketReceivedSmallDelta => 1,
            SymbolTypeTcc::PacketReceivedLargeDelta => 2,
            _ => 0,
        }
    }
}

#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u16)]
pub enum SymbolSizeTypeTcc {
    #[default]
    OneBit = 0,
    TwoBit = 1,
}

impl SymbolSizeTypeTcc {
    fn bits(&self) -> u16 {
        match self {
            SymbolSizeTypeTcc::OneBit => 1,
            SymbolSizeTypeTcc::TwoBit => 2,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            SymbolSizeTypeTcc::OneBit => ONE_BIT_VECTOR_CAPACITY,
            SymbolSizeTypeTcc::TwoBit => TWO_BIT_VECTOR_CAPACITY,
        }
    }
}

/// A packet status chunk.
///
/// ```text
/// run length chunk               status vector chunk
///  0                   1          0                   1
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0| S |       Run Length        | |1|S|       symbol list         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketStatusChunk {
    RunLength {
        symbol: SymbolTypeTcc,
        run_length: u16,
    },
    /// Holds up to 14 one-bit or 7 two-bit symbols; missing trailing slots are
    /// written as zero.
    StatusVector {
        symbol_size: SymbolSizeTypeTcc,
        symbols: Vec<SymbolTypeTcc>,
    },
}

impl PacketStatusChunk {
    /// Number of packets this chunk describes.
    pub fn len(&self) -> usize {
        match self {
            PacketStatusChunk::RunLength { run_length, .. } => *run_length as usize,
            PacketStatusChunk::StatusVector { symbols, .. } => symbols.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MarshalSize for PacketStatusChunk {
    fn marshal_size(&self) -> usize {
        PACKET_STATUS_CHUNK_LENGTH
    }
}

impl Marshal for PacketStatusChunk {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < PACKET_STATUS_CHUNK_LENGTH {
            return Err(Error::BufferTooShort.into());
        }

        let dst = match self {
            PacketStatusChunk::RunLength { symbol, run_length } => {
                if *run_length > MAX_RUN_LENGTH {
                    return Err(Error::PacketStatusChunkLength.into());
                }
                let dst = set_nbits_of_uint16(0, 2, 1, *symbol as u16)?;
                set_nbits_of_uint16(dst, 13, 3, *run_length)?
            }
            PacketStatusChunk::StatusVector {
                symbol_size,
                symbols,
            } => {
                if symbols.len() > symbol_size.capacity() {
                    return Err(Error::PacketStatusChunkLength.into());
                }
                let bits = symbol_size.bits();
                let mut dst = set_nbits_of_uint16(0, 1, 0, 1)?;
                dst = set_nbits_of_uint16(dst, 1, 1, *symbol_size as u16)?;
                for (i, s) in symbols.iter().enumerate() {
                    dst = set_nbits_of_uint16(dst, bits, 2 + bits * i as u16, *s as u16)?;
                }
                dst
            }
        };

        buf.put_u16(dst);
        Ok(PACKET_STATUS_CHUNK_LENGTH)
    }
}

impl Unmarshal for PacketStatusChunk {
    /// Decodes a chunk. Status vectors always come back with their full capacity of
    /// symbols; the caller clamps them to the packet status count.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < PACKET_STATUS_CHUNK_LENGTH {
            return Err(Error::PacketStatusChunkLength.into());
        }

        let b0 = raw_packet.get_u8();
        let b1 = raw_packet.get_u8();

        if get_nbits_from_byte(b0, 0, 1) == 0 {
            let symbol = get_nbits_from_byte(b0, 1, 2).into();
            let run_length = (get_nbits_from_byte(b0, 3, 5) << 8) | b1 as u16;
            return Ok(PacketStatusChunk::RunLength { symbol, run_length });
        }

        let word = ((b0 as u16) << 8) | b1 as u16;
        let symbol_size = if get_nbits_from_byte(b0, 1, 1) == 0 {
            SymbolSizeTypeTcc::OneBit
        } else {
            SymbolSizeTypeTcc::TwoBit
        };
        let bits = symbol_size.bits();
        let mask = (1u16 << bits) - 1;
        let symbols = (0..symbol_size.capacity() as u16)
            .map(|i| {
                let shift = 16 - 2 - bits * (i + 1);
                ((word >> shift) & mask).into()
            })
            .collect();

        Ok(PacketStatusChunk::StatusVector {
            symbol_size,
            symbols,
        })
    }
}

/// A receive delta, in microseconds. The wire carries it in 250 µs units, one
/// unsigned byte for small deltas and two signed bytes for large ones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecvDelta {
    pub type_tcc_packet: SymbolTypeTcc,
    pub delta: i64,
}

impl MarshalSize for RecvDelta {
    fn marshal_size(&self) -> usize {
        self.type_tcc_packet.delta_size()
    }
}

impl Marshal for RecvDelta {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let delta = self.delta / TYPE_TCC_DELTA_SCALE_FACTOR;

        match self.type_tcc_packet {
            SymbolTypeTcc::PacketReceivedSmallDelta
                if (0..=u8::MAX as i64).contains(&delta) && buf.remaining_mut() >= 1 =>
            {
                buf.put_u8(delta as u8);
                Ok(1)
            }
            SymbolTypeTcc::PacketReceivedLargeDelta
                if (i16::MIN as i64..=i16::MAX as i64).contains(&delta)
                    && buf.remaining_mut() >= 2 =>
            {
                buf.put_i16(delta as i16);
                Ok(2)
            }
            _ => Err(Error::DeltaExceedLimit.into()),
        }
    }
}

/// TransportLayerCc is the transport-wide congestion control feedback, RTPFB FMT=15.
/// https://tools.ietf.org/html/draft-holmer-rmcat-transport-wide-cc-extensions-01#section-3.1
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|  FMT=15 |    PT=205     |           length              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     SSRC of packet sender                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      SSRC of media source                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      base sequence number     |      packet status count      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 reference time                | fb pkt. count |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          packet chunk         |         packet chunk          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         packet chunk          |  recv delta   |  recv delta   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           recv delta          |  recv delta   | zero padding  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The trailing alignment is written as zero octets without setting the P bit.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TransportLayerCc {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// Transport-wide sequence number of the first packet described
    pub base_sequence_number: u16,
    /// Packets described, gaps included
    pub packet_status_count: u16,
    /// 24 bits, in multiples of 64 ms
    pub reference_time: u32,
    pub fb_pkt_count: u8,
    pub packet_chunks: Vec<PacketStatusChunk>,
    pub recv_deltas: Vec<RecvDelta>,
}

impl TransportLayerCc {
    /// Per-packet statuses in sequence order, clamped to `packet_status_count`.
    pub fn symbols(&self) -> Vec<SymbolTypeTcc> {
        let count = self.packet_status_count as usize;
        let mut out = Vec::with_capacity(count);
        for chunk in &self.packet_chunks {
            let left = count - out.len();
            if left == 0 {
                break;
            }
            match chunk {
                PacketStatusChunk::RunLength { symbol, run_length } => {
                    let n = (*run_length as usize).min(left);
                    out.extend(std::iter::repeat(*symbol).take(n));
                }
                PacketStatusChunk::StatusVector { symbols, .. } => {
                    out.extend(symbols.iter().take(left).copied());
                }
            }
        }
        out
    }

    /// Encoded FCI, from the base sequence number through the zero padding.
    pub fn fci(&self) -> Result<Bytes> {
        let data = self.marshal()?;
        Ok(data.slice(HEADER_LENGTH + SSRC_LENGTH * 2..))
    }
}

impl fmt::Display for TransportLayerCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out += format!("TransportLayerCC:\n\tSender Ssrc {:x}\n", self.sender_ssrc).as_str();
        out += format!("\tMedia Ssrc {:x}\n", self.media_ssrc).as_str();
        out += format!("\tBase Sequence Number {}\n", self.base_sequence_number).as_str();
        out += format!("\tStatus Count {}\n", self.packet_status_count).as_str();
        out += format!("\tReference Time {}\n", self.reference_time).as_str();
        out += format!("\tFeedback Packet Count {}\n", self.fb_pkt_count).as_str();
        out += format!("\tpacket_chunks {:?}\n", self.packet_chunks).as_str();
        out += "\trecv_deltas ";
        for delta in &self.recv_deltas {
            out += format!("{} ", delta.delta).as_str();
        }
        out += "\n";

        write!(f, "{out}")
    }
}

impl Packet for TransportLayerCc {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_TCC,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
    }

    fn raw_size(&self) -> usize {
        PACKET_CHUNK_OFFSET
            + self.packet_chunks.len() * PACKET_STATUS_CHUNK_LENGTH
            + self
                .recv_deltas
                .iter()
                .map(|d| d.marshal_size())
                .sum::<usize>()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<TransportLayerCc>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for TransportLayerCc {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        l + get_padding_size(l)
    }
}

impl Marshal for TransportLayerCc {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u16(self.base_sequence_number);
        buf.put_u16(self.packet_status_count);

        let reference_time_and_fb_pkt_count = append_nbits_to_uint32(0, 24, self.reference_time);
        buf.put_u32(append_nbits_to_uint32(
            reference_time_and_fb_pkt_count,
            8,
            self.fb_pkt_count as u32,
        ));

        for chunk in &self.packet_chunks {
            let n = chunk.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        for delta in &self.recv_deltas {
            let n = delta.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        put_zero_padding(buf, self.raw_size());

        Ok(self.marshal_size())
    }
}

impl Unmarshal for TransportLayerCc {
    /// Decodes the feedback. A status count asking for more chunks or deltas than
    /// the packet holds is rejected with `PacketStatusCountExceeded`.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < PACKET_CHUNK_OFFSET {
            return Err(Error::PacketTooShort.into());
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::TransportSpecificFeedback || h.count != FORMAT_TCC {
            return Err(Error::WrongType.into());
        }

        let mut body = h.read_body(raw_packet)?;
        if body.remaining() < PACKET_CHUNK_OFFSET - HEADER_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let sender_ssrc = body.get_u32();
        let media_ssrc = body.get_u32();
        let base_sequence_number = body.get_u16();
        let packet_status_count = body.get_u16();
        let reference_time = get_24bits_from_bytes(&body[..3]);
        body.advance(3);
        let fb_pkt_count = body.get_u8();

        let mut packet_chunks = vec![];
        let mut symbols: Vec<SymbolTypeTcc> = Vec::with_capacity(packet_status_count as usize);
        while symbols.len() < packet_status_count as usize {
            if body.remaining() < PACKET_STATUS_CHUNK_LENGTH {
                return Err(Error::PacketStatusCountExceeded.into());
            }

            let chunk = PacketStatusChunk::unmarshal(&mut body)?;
            let left = packet_status_count as usize - symbols.len();
            match &chunk {
                PacketStatusChunk::RunLength { symbol, run_length } => {
                    let n = (*run_length as usize).min(left);
                    symbols.extend(std::iter::repeat(*symbol).take(n));
                }
                PacketStatusChunk::StatusVector { symbols: list, .. } => {
                    symbols.extend(list.iter().take(left).copied());
                }
            }
            packet_chunks.push(chunk);
        }

        let mut recv_deltas = vec![];
        for symbol in symbols {
            let delta = match symbol {
                SymbolTypeTcc::PacketReceivedSmallDelta => {
                    if body.remaining() < 1 {
                        return Err(Error::PacketStatusCountExceeded.into());
                    }
                    body.get_u8() as i64
                }
                SymbolTypeTcc::PacketReceivedLargeDelta => {
                    if body.remaining() < 2 {
                        return Err(Error::PacketStatusCountExceeded.into());
                    }
                    body.get_i16() as i64
                }
                _ => continue,
            };
            recv_deltas.push(RecvDelta {
                type_tcc_packet: symbol,
                delta: delta * TYPE_TCC_DELTA_SCALE_FACTOR,
            });
        }

        Ok(TransportLayerCc {
            sender_ssrc,
            media_ssrc,
            base_sequence_number,
            packet_status_count,
            reference_time,
            fb_pkt_count,
            packet_chunks,
            recv_deltas,
        })
    }
}
