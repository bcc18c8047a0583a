#[cfg(test)]
mod full_intra_request_test;

use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;

type Result<T> = std::result::Result<T, util::Error>;

const FIR_OFFSET: usize = HEADER_LENGTH + SSRC_LENGTH * 2;
const FIR_ENTRY_LENGTH: usize = 8;

/// One FCI entry of a FIR: the encoder being asked to refresh and the request's
/// 8-bit command sequence number.
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

/// The FullIntraRequest packet (RFC 5104 4.3.1) asks one or more media senders to
/// send a decoder refresh point. Several targets share one packet.
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|  FMT=4  |   PT=PSFB=206 |          length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  SSRC of packet sender                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  SSRC of media source (0)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                              SSRC                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Seq nr.       |    Reserved                                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct FullIntraRequest {
    pub sender_ssrc: u32,
    /// Unused by FIR and sent as zero.
    pub media_ssrc: u32,
    pub fir: Vec<FirEntry>,
}

impl fmt::Display for FullIntraRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("FullIntraRequest {:x} {:x}", self.sender_ssrc, self.media_ssrc);
        for e in &self.fir {
            out += format!(" ({:x} {})", e.ssrc, e.sequence_number).as_str();
        }
        write!(f, "{out}")
    }
}

impl Packet for FullIntraRequest {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_FIR,
            packet_type: PacketType::PayloadSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.fir.iter().map(|e| e.ssrc).collect()
    }

    fn raw_size(&self) -> usize {
        FIR_OFFSET + self.fir.len() * FIR_ENTRY_LENGTH
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<FullIntraRequest>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for FullIntraRequest {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for FullIntraRequest {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let n = self.header().marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);

        for e in &self.fir {
            buf.put_u32(e.ssrc);
            buf.put_u8(e.sequence_number);
            buf.put_bytes(0, 3);
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for FullIntraRequest {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < FIR_OFFSET {
            return Err(Error::PacketTooShort.into());
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::PayloadSpecificFeedback || h.count != FORMAT_FIR {
            return Err(Error::WrongType.into());
        }

        let mut body = h.read_body(raw_packet)?;
        if body.remaining() < SSRC_LENGTH * 2 {
            return Err(Error::PacketTooShort.into());
        }

        let sender_ssrc = body.get_u32();
        let media_ssrc = body.get_u32();

        let mut fir = Vec::with_capacity(body.remaining() / FIR_ENTRY_LENGTH);
        while body.remaining() >= FIR_ENTRY_LENGTH {
            let ssrc = body.get_u32();
            let sequence_number = body.get_u8();
            body.advance(3);
            fir.push(FirEntry {
                ssrc,
                sequence_number,
            });
        }

        Ok(FullIntraRequest {
            sender_ssrc,
            media_ssrc,
            fir,
        })
    }
}
