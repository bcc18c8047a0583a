
use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;

type Result<T> = std::result::Result<T, util::Error>;

const APP_NAME_LENGTH: usize = 4;

/// ApplicationDefined (APP) carries experimental or application specific data.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| subtype |   PT=APP=204  |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           SSRC/CSRC                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          name (ASCII)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   application-dependent data                ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct ApplicationDefined {
    /// Five bit subtype.
    pub sub_type: u8,
    pub ssrc: u32,
    /// Four ASCII characters.
    pub name: String,
    /// Must be a multiple of 32 bits long.
    pub data: Bytes,
}

impl fmt::Display for ApplicationDefined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ApplicationDefined {:x} name={} subtype={} data={} bytes",
            self.ssrc,
            self.name,
            self.sub_type,
            self.data.len()
        )
    }
}

impl Packet for ApplicationDefined {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.sub_type,
            packet_type: PacketType::ApplicationDefined,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.ssrc]
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH + APP_NAME_LENGTH + self.data.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<ApplicationDefined>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for ApplicationDefined {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for ApplicationDefined {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.sub_type as usize > COUNT_MAX {
            return Err(Error::InvalidAppSubtype.into());
        }
        if self.name.len() != APP_NAME_LENGTH || !self.name.is_ascii() {
            return Err(Error::InvalidAppName.into());
        }
        if self.data.len() % 4 != 0 {
            return Err(Error::InvalidAppDataLength.into());
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.ssrc);
        buf.put_slice(self.name.as_bytes());
        buf.put(self.data.clone());

        Ok(self.marshal_size())
    }
}

impl Unmarshal for ApplicationDefined {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < HEADER_LENGTH + SSRC_LENGTH + APP_NAME_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::ApplicationDefined {
            return Err(Error::WrongType.into());
        }

        let mut body = h.read_body(raw_packet)?;
        if body.remaining() < SSRC_LENGTH + APP_NAME_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let ssrc = body.get_u32();
        let name_bytes = body.split_to(APP_NAME_LENGTH);
        if !name_bytes.is_ascii() {
            return Err(Error::InvalidAppName.into());
        }
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        Ok(ApplicationDefined {
            sub_type: h.count,
            ssrc,
            name,
            data: body,
        })
    }
}
