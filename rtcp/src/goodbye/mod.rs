#[cfg(test)]
mod goodbye_test;

use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;
use crate::util::*;

type Result<T> = std::result::Result<T, util::Error>;

/// The Goodbye (BYE) packet indicates that one or more sources are no longer active.
///
/// ```text
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |V=2|P|    SC   |   PT=BYE=203  |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                           SSRC/CSRC                           |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        :                              ...                              :
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
///  (opt) |     length    |               reason for leaving            ...
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The reason is followed by null octets up to the next 32-bit boundary; the P bit
/// is not used for that.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    /// Optional text, at most 255 octets.
    pub reason: Bytes,
}

impl Goodbye {
    pub fn new(source: u32, reason: impl Into<Bytes>) -> Self {
        Goodbye {
            sources: vec![source],
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Goodbye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "Goodbye\n".to_string();
        for s in &self.sources {
            out += format!("\tSource: {s:x}\n").as_str();
        }
        if !self.reason.is_empty() {
            out += format!("\tReason: {:?}\n", self.reason).as_str();
        }

        write!(f, "{out}")
    }
}

impl Packet for Goodbye {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.sources.len() as u8,
            packet_type: PacketType::Goodbye,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.sources.clone()
    }

    fn raw_size(&self) -> usize {
        let reason_len = if self.reason.is_empty() {
            0
        } else {
            1 + self.reason.len()
        };
        HEADER_LENGTH + self.sources.len() * SSRC_LENGTH + reason_len
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<Goodbye>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for Goodbye {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        l + get_padding_size(l)
    }
}

impl Marshal for Goodbye {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.sources.len() > COUNT_MAX {
            return Err(Error::TooManySources.into());
        }
        if self.reason.len() > SDES_MAX_OCTET_COUNT {
            return Err(Error::ReasonTooLong.into());
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        for source in &self.sources {
            buf.put_u32(*source);
        }

        if !self.reason.is_empty() {
            buf.put_u8(self.reason.len() as u8);
            buf.put(self.reason.clone());
        }

        put_zero_padding(buf, self.raw_size());

        Ok(self.marshal_size())
    }
}

impl Unmarshal for Goodbye {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::Goodbye {
            return Err(Error::WrongType.into());
        }

        let mut body = header.read_body(raw_packet)?;
        let sources_len = header.count as usize * SSRC_LENGTH;
        if body.remaining() < sources_len {
            return Err(Error::PacketTooShort.into());
        }

        let mut sources = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            sources.push(body.get_u32());
        }

        let reason = if body.has_remaining() {
            let reason_len = body.get_u8() as usize;
            if reason_len > body.remaining() {
                return Err(Error::PacketTooShort.into());
            }
            body.copy_to_bytes(reason_len)
        } else {
            Bytes::new()
        };

        Ok(Goodbye { sources, reason })
    }
}
