use bytes::{Buf, BufMut, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;

/// PacketType specifies the type of an RTCP packet.
/// See: https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-4
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    #[default]
    Unsupported = 0,
    SenderReport = 200,              // RFC 3550, 6.4.1
    ReceiverReport = 201,            // RFC 3550, 6.4.2
    SourceDescription = 202,         // RFC 3550, 6.5
    Goodbye = 203,                   // RFC 3550, 6.6
    ApplicationDefined = 204,        // RFC 3550, 6.7
    TransportSpecificFeedback = 205, // RFC 4585, 6.2
    PayloadSpecificFeedback = 206,   // RFC 4585, 6.3
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PacketType::Unsupported => "Unsupported",
            PacketType::SenderReport => "SR",
            PacketType::ReceiverReport => "RR",
            PacketType::SourceDescription => "SDES",
            PacketType::Goodbye => "BYE",
            PacketType::ApplicationDefined => "APP",
            PacketType::TransportSpecificFeedback => "RTPFB",
            PacketType::PayloadSpecificFeedback => "PSFB",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for PacketType {
    fn from(b: u8) -> Self {
        match b {
            200 => PacketType::SenderReport,
            201 => PacketType::ReceiverReport,
            202 => PacketType::SourceDescription,
            203 => PacketType::Goodbye,
            204 => PacketType::ApplicationDefined,
            205 => PacketType::TransportSpecificFeedback,
            206 => PacketType::PayloadSpecificFeedback,
            _ => PacketType::Unsupported,
        }
    }
}

// Feedback messages overload the count field as FMT.
/// PSFB FMT of a Picture Loss Indication (RFC 4585 6.3.1)
pub const FORMAT_PLI: u8 = 1;
/// PSFB FMT of a Full Intra Request (RFC 5104 4.3.1)
pub const FORMAT_FIR: u8 = 4;
/// RTPFB FMT of a Generic NACK (RFC 4585 6.2.1)
pub const FORMAT_TLN: u8 = 1;
/// RTPFB FMT of Transport-wide Congestion Control feedback.
/// https://tools.ietf.org/html/draft-holmer-rmcat-transport-wide-cc-extensions-01#section-3.1
pub const FORMAT_TCC: u8 = 15;

pub const RTP_VERSION: u8 = 2;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const PADDING_MASK: u8 = 0x1;
pub const COUNT_MASK: u8 = 0x1f;

pub const HEADER_LENGTH: usize = 4;
pub const COUNT_MAX: usize = (1 << 5) - 1;
pub const SSRC_LENGTH: usize = 4;
pub const SDES_MAX_OCTET_COUNT: usize = (1 << 8) - 1;

/// A Header is the common header shared by all RTCP packets
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Header {
    /// Set when the packet carries trailing padding octets, the last of which
    /// holds the padding count.
    pub padding: bool,
    /// Report count, source count or FMT depending on the packet type
    pub count: u8,
    pub packet_type: PacketType,
    /// Length of the packet in 32-bit words minus one, header and padding included.
    pub length: u16,
}

impl Header {
    /// Size in bytes of the whole packet this header describes.
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    /// Consumes the body announced by this header from `raw_packet` and returns it
    /// with any trailing padding removed. Bytes beyond the announced length are left
    /// in `raw_packet`.
    pub fn read_body<B: Buf>(&self, raw_packet: &mut B) -> Result<Bytes, Error> {
        let body_len = self.packet_size() - HEADER_LENGTH;
        if raw_packet.remaining() < body_len {
            return Err(Error::PacketTooShort);
        }

        let mut body = raw_packet.copy_to_bytes(body_len);
        if self.padding {
            let padding_len = body.last().copied().unwrap_or(0) as usize;
            if padding_len == 0 || padding_len > body.len() {
                return Err(Error::WrongPadding);
            }
            body.truncate(body.len() - padding_len);
        }

        Ok(body)
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
    }
}

impl Marshal for Header {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize, util::Error> {
        if self.count as usize > COUNT_MAX {
            return Err(Error::InvalidHeader.into());
        }
        if buf.remaining_mut() < HEADER_LENGTH {
            return Err(Error::BufferTooShort.into());
        }

        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|  RC/FMT |      PT       |             length            |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let b0 = (RTP_VERSION << VERSION_SHIFT)
            | ((self.padding as u8) << PADDING_SHIFT)
            | (self.count & COUNT_MASK);

        buf.put_u8(b0);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.length);

        Ok(HEADER_LENGTH)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self, util::Error>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < HEADER_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let b0 = raw_packet.get_u8();
        if (b0 >> VERSION_SHIFT) & VERSION_MASK != RTP_VERSION {
            return Err(Error::BadVersion.into());
        }

        Ok(Header {
            padding: (b0 >> PADDING_SHIFT) & PADDING_MASK != 0,
            count: b0 & COUNT_MASK,
            packet_type: PacketType::from(raw_packet.get_u8()),
            length: raw_packet.get_u16(),
        })
    }
}
