#[cfg(test)]
mod transport_layer_nack_test;

use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;

type Result<T> = std::result::Result<T, util::Error>;

const NACK_OFFSET: usize = HEADER_LENGTH + SSRC_LENGTH * 2;
pub const NACK_PAIR_LENGTH: usize = 4;
/// Size of a NACK packet without any FCI entry.
pub const NACK_HEADER_LENGTH: usize = NACK_OFFSET;

/// NackPair is one Generic NACK FCI entry: a lost packet id and a bitmask of lost
/// packets among the 16 that follow it.
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct NackPair {
    /// PID, the first lost packet
    pub packet_id: u16,
    /// BLP, bit i set means packet_id + i + 1 is lost too
    pub lost_packets: u16,
}

impl NackPair {
    pub fn new(seq: u16) -> Self {
        NackPair {
            packet_id: seq,
            lost_packets: 0,
        }
    }

    /// Sequence numbers this entry reports, in increasing wrapping order.
    pub fn packet_list(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(1 + self.lost_packets.count_ones() as usize);
        out.push(self.packet_id);
        for i in 0..16u16 {
            if self.lost_packets & (1 << i) != 0 {
                out.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        out
    }

    /// Adds `seq` to this entry when it lies within the 16 packets after the PID.
    pub fn try_add(&mut self, seq: u16) -> bool {
        let diff = seq.wrapping_sub(self.packet_id);
        match diff {
            0 => true,
            1..=16 => {
                self.lost_packets |= 1 << (diff - 1);
                true
            }
            _ => false,
        }
    }
}

/// Packs sequence numbers, already sorted in wrapping order, into NACK entries. A
/// number more than 16 past the current PID opens a new entry.
pub fn nack_pairs_from_sequence_numbers(seq_nos: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = vec![];
    for &seq in seq_nos {
        if let Some(last) = pairs.last_mut() {
            if last.try_add(seq) {
                continue;
            }
        }
        pairs.push(NackPair::new(seq));
    }
    pairs
}

/// The TransportLayerNack packet (RFC 4585 6.2.1) reports lost RTP packets of one
/// media source.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct TransportLayerNack {
    /// SSRC of sender
    pub sender_ssrc: u32,
    /// SSRC of the media source
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl TransportLayerNack {
    /// All sequence numbers requested by this packet.
    pub fn sequence_numbers(&self) -> Vec<u16> {
        self.nacks.iter().flat_map(|n| n.packet_list()).collect()
    }
}

impl fmt::Display for TransportLayerNack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("TransportLayerNack from {:x}\n", self.sender_ssrc);
        out += format!("\tMedia Ssrc {:x}\n", self.media_ssrc).as_str();
        out += "\tID\tLostPackets\n";
        for nack in &self.nacks {
            out += format!("\t{}\t{:016b}\n", nack.packet_id, nack.lost_packets).as_str();
        }
        write!(f, "{out}")
    }
}

impl Packet for TransportLayerNack {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_TLN,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
    }

    fn raw_size(&self) -> usize {
        NACK_OFFSET + self.nacks.len() * NACK_PAIR_LENGTH
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for TransportLayerNack {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for TransportLayerNack {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.nacks.len() + 2 > u16::MAX as usize {
            return Err(Error::TooManyReports.into());
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let n = self.header().marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);

        for nack in &self.nacks {
            buf.put_u16(nack.packet_id);
            buf.put_u16(nack.lost_packets);
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for TransportLayerNack {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < NACK_OFFSET {
            return Err(Error::PacketTooShort.into());
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::TransportSpecificFeedback || h.count != FORMAT_TLN {
            return Err(Error::WrongType.into());
        }

        let mut body = h.read_body(raw_packet)?;
        if body.remaining() < SSRC_LENGTH * 2 {
            return Err(Error::PacketTooShort.into());
        }

        let sender_ssrc = body.get_u32();
        let media_ssrc = body.get_u32();

        let mut nacks = Vec::with_capacity(body.remaining() / NACK_PAIR_LENGTH);
        while body.remaining() >= NACK_PAIR_LENGTH {
            nacks.push(NackPair {
                packet_id: body.get_u16(),
                lost_packets: body.get_u16(),
            });
        }

        Ok(TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks,
        })
    }
}
