
use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::Packet;

type Result<T> = std::result::Result<T, util::Error>;

/// RawPacket represents an unparsed RTCP packet. It's returned by unmarshal when
/// a packet with an unknown type is encountered, and it carries pre-encoded
/// packets built outside this crate.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct RawPacket(pub Bytes);

impl fmt::Display for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPacket: {:?}", self.0)
    }
}

impl Packet for RawPacket {
    /// Header parsed from the first four octets, or the default header when
    /// those are missing or invalid.
    fn header(&self) -> Header {
        Header::unmarshal(&mut self.0.clone()).unwrap_or_default()
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![]
    }

    fn raw_size(&self) -> usize {
        self.0.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<RawPacket>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for RawPacket {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for RawPacket {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.raw_size() {
            return Err(Error::BufferTooShort.into());
        }
        buf.put(self.0.clone());
        Ok(self.raw_size())
    }
}

impl Unmarshal for RawPacket {
    /// Takes every remaining octet, after checking they start with a valid header.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let raw = raw_packet.copy_to_bytes(raw_packet_len);
        Header::unmarshal(&mut raw.clone())?;

        Ok(RawPacket(raw))
    }
}
