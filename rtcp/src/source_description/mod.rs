
use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;
use crate::util::*;

type Result<T> = std::result::Result<T, util::Error>;

const SDES_SOURCE_LEN: usize = 4;
const SDES_TYPE_LEN: usize = 1;
const SDES_OCTET_COUNT_LEN: usize = 1;

/// SDES item types, RFC 3550 6.5.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesType {
    #[default]
    SdesEnd = 0,
    SdesCname = 1,
    SdesName = 2,
    SdesEmail = 3,
    SdesPhone = 4,
    SdesLocation = 5,
    SdesTool = 6,
    SdesNote = 7,
    SdesPrivate = 8,
}

impl fmt::Display for SdesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdesType::SdesEnd => "END",
            SdesType::SdesCname => "CNAME",
            SdesType::SdesName => "NAME",
            SdesType::SdesEmail => "EMAIL",
            SdesType::SdesPhone => "PHONE",
            SdesType::SdesLocation => "LOC",
            SdesType::SdesTool => "TOOL",
            SdesType::SdesNote => "NOTE",
            SdesType::SdesPrivate => "PRIV",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for SdesType {
    fn from(b: u8) -> Self {
        match b {
            1 => SdesType::SdesCname,
            2 => SdesType::SdesName,
            3 => SdesType::SdesEmail,
            4 => SdesType::SdesPhone,
            5 => SdesType::SdesLocation,
            6 => SdesType::SdesTool,
            7 => SdesType::SdesNote,
            8 => SdesType::SdesPrivate,
            _ => SdesType::SdesEnd,
        }
    }
}

/// One typed, length-prefixed text item of a chunk.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct SourceDescriptionItem {
    pub sdes_type: SdesType,
    /// Item payload. For PRIV items this holds the prefix length octet, the
    /// prefix and the value, see [`SourceDescriptionItem::private`].
    pub text: Bytes,
}

impl SourceDescriptionItem {
    pub fn new(sdes_type: SdesType, text: impl Into<Bytes>) -> Self {
        SourceDescriptionItem {
            sdes_type,
            text: text.into(),
        }
    }

    /// Builds a PRIV item out of its prefix and value.
    pub fn private(prefix: &[u8], value: &[u8]) -> std::result::Result<Self, Error> {
        if prefix.len() + value.len() + 1 > SDES_MAX_OCTET_COUNT {
            return Err(Error::SdesTextTooLong);
        }
        let mut text = BytesMut::with_capacity(prefix.len() + value.len() + 1);
        text.put_u8(prefix.len() as u8);
        text.extend_from_slice(prefix);
        text.extend_from_slice(value);
        Ok(SourceDescriptionItem {
            sdes_type: SdesType::SdesPrivate,
            text: text.freeze(),
        })
    }

    /// Splits a PRIV item into (prefix, value). Returns None for other item types
    /// or when the prefix length overruns the item.
    pub fn private_parts(&self) -> Option<(Bytes, Bytes)> {
        if self.sdes_type != SdesType::SdesPrivate || self.text.is_empty() {
            return None;
        }
        let prefix_len = self.text[0] as usize;
        if 1 + prefix_len > self.text.len() {
            return None;
        }
        Some((
            self.text.slice(1..1 + prefix_len),
            self.text.slice(1 + prefix_len..),
        ))
    }
}

impl MarshalSize for SourceDescriptionItem {
    fn marshal_size(&self) -> usize {
        SDES_TYPE_LEN + SDES_OCTET_COUNT_LEN + self.text.len()
    }
}

impl Marshal for SourceDescriptionItem {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        /*
         *   0                   1                   2                   3
         *   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *  |    CNAME=1    |     length    | user and domain name        ...
         *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        if self.sdes_type == SdesType::SdesEnd {
            return Err(Error::SdesMissingType.into());
        }
        if self.text.len() > SDES_MAX_OCTET_COUNT {
            return Err(Error::SdesTextTooLong.into());
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        buf.put_u8(self.sdes_type as u8);
        buf.put_u8(self.text.len() as u8);
        buf.put(self.text.clone());

        Ok(self.marshal_size())
    }
}

impl Unmarshal for SourceDescriptionItem {
    /// Reads one item. A bare END octet yields an item of type `SdesEnd` with no text.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if !raw_packet.has_remaining() {
            return Err(Error::PacketTooShort.into());
        }

        let sdes_type = SdesType::from(raw_packet.get_u8());
        if sdes_type == SdesType::SdesEnd {
            return Ok(SourceDescriptionItem::default());
        }

        if !raw_packet.has_remaining() {
            return Err(Error::PacketTooShort.into());
        }
        let octet_count = raw_packet.get_u8() as usize;
        if raw_packet.remaining() < octet_count {
            return Err(Error::PacketTooShort.into());
        }

        Ok(SourceDescriptionItem {
            sdes_type,
            text: raw_packet.copy_to_bytes(octet_count),
        })
    }
}

/// A SourceDescriptionChunk contains items describing a single RTP source
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct SourceDescriptionChunk {
    /// The ssrc or csrc this chunk describes
    pub source: u32,
    pub items: Vec<SourceDescriptionItem>,
}

impl SourceDescriptionChunk {
    fn raw_size(&self) -> usize {
        // the item list ends with at least one null octet
        SDES_SOURCE_LEN
            + self.items.iter().map(|it| it.marshal_size()).sum::<usize>()
            + SDES_TYPE_LEN
    }

    /// Text of the first item of the given type.
    pub fn item(&self, sdes_type: SdesType) -> Option<&Bytes> {
        self.items
            .iter()
            .find(|it| it.sdes_type == sdes_type)
            .map(|it| &it.text)
    }
}

impl MarshalSize for SourceDescriptionChunk {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        l + get_padding_size(l)
    }
}

impl Marshal for SourceDescriptionChunk {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        buf.put_u32(self.source);
        for it in &self.items {
            let n = it.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        // END, then null octets up to the next 32-bit boundary
        buf.put_u8(SdesType::SdesEnd as u8);
        put_zero_padding(buf, self.raw_size());

        Ok(self.marshal_size())
    }
}

impl Unmarshal for SourceDescriptionChunk {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < SDES_SOURCE_LEN + SDES_TYPE_LEN {
            return Err(Error::PacketTooShort.into());
        }

        let source = raw_packet.get_u32();
        let mut consumed = SDES_SOURCE_LEN;
        let mut items = vec![];
        loop {
            let item = SourceDescriptionItem::unmarshal(raw_packet)?;
            if item.sdes_type == SdesType::SdesEnd {
                consumed += SDES_TYPE_LEN;
                break;
            }
            consumed += item.marshal_size();
            items.push(item);
        }

        // Senders may end the chunk exactly at the packet end without alignment.
        let padding_len = get_padding_size(consumed).min(raw_packet.remaining());
        raw_packet.advance(padding_len);

        Ok(SourceDescriptionChunk { source, items })
    }
}

/// A SourceDescription (SDES) packet describes the sources in an RTP stream.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct SourceDescription {
    pub chunks: Vec<SourceDescriptionChunk>,
}

impl SourceDescription {
    /// Shorthand for a single chunk holding only a CNAME.
    pub fn with_cname(source: u32, cname: impl Into<Bytes>) -> Self {
        SourceDescription {
            chunks: vec![SourceDescriptionChunk {
                source,
                items: vec![SourceDescriptionItem::new(SdesType::SdesCname, cname)],
            }],
        }
    }
}

impl fmt::Display for SourceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "Source Description:\n".to_string();
        for c in &self.chunks {
            out += format!("\t{:x}\n", c.source).as_str();
            for it in &c.items {
                out += format!("\t\t{}: {:?}\n", it.sdes_type, it.text).as_str();
            }
        }
        write!(f, "{out}")
    }
}

impl Packet for SourceDescription {
    fn header(&self) -> Header {
        Header {
            padding: get_padding_size(self.raw_size()) != 0,
            count: self.chunks.len() as u8,
            packet_type: PacketType::SourceDescription,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.source).collect()
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH + self.chunks.iter().map(|c| c.marshal_size()).sum::<usize>()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<SourceDescription>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for SourceDescription {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        l + get_padding_size(l)
    }
}

impl Marshal for SourceDescription {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        /*
         *         0                   1                   2                   3
         *         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * header |V=2|P|    SC   |  PT=SDES=202  |             length            |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * chunk  |                          SSRC/CSRC_1                          |
         *   1    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                           SDES items                          |
         *        |                              ...                              |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         */
        if self.chunks.len() > COUNT_MAX {
            return Err(Error::TooManyChunks.into());
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort.into());
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        for c in &self.chunks {
            let n = c.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for SourceDescription {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::SourceDescription {
            return Err(Error::WrongType.into());
        }

        let mut body = h.read_body(raw_packet)?;
        let mut chunks = Vec::with_capacity(h.count as usize);
        for _ in 0..h.count {
            chunks.push(SourceDescriptionChunk::unmarshal(&mut body)?);
        }

        Ok(SourceDescription { chunks })
    }
}
