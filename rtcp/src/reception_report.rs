use std::fmt;

use bytes::{Buf, BufMut};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;

pub const RECEPTION_REPORT_LENGTH: usize = 24;

const MAX_TOTAL_LOST: u32 = (1 << 24) - 1;

/// A ReceptionReport block conveys statistics on the reception of RTP packets
/// from a single synchronization source. It only travels inside SR and RR packets.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct ReceptionReport {
    /// The source this block reports on.
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost, a 24-bit quantity.
    pub total_lost: u32,
    /// Highest sequence number received, extended with the cycle count in the
    /// upper 16 bits.
    pub last_sequence_number: u32,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp of the last SR heard from `ssrc`.
    pub last_sender_report: u32,
    /// Delay since that SR, in 1/65536 seconds.
    pub delay: u32,
}

impl fmt::Display for ReceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}\t{}/{}\t{}\tjitter={}\tlsr={:x}\tdlsr={}",
            self.ssrc,
            self.fraction_lost,
            self.total_lost,
            self.last_sequence_number,
            self.jitter,
            self.last_sender_report,
            self.delay
        )
    }
}

impl MarshalSize for ReceptionReport {
    fn marshal_size(&self) -> usize {
        RECEPTION_REPORT_LENGTH
    }
}

impl Marshal for ReceptionReport {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize, util::Error> {
        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * |                              SSRC                             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * | fraction lost |       cumulative number of packets lost       |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |           extended highest sequence number received           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                      interarrival jitter                      |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                         last SR (LSR)                         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                   delay since last SR (DLSR)                  |
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         */
        if buf.remaining_mut() < RECEPTION_REPORT_LENGTH {
            return Err(Error::BufferTooShort.into());
        }
        if self.total_lost > MAX_TOTAL_LOST {
            return Err(Error::InvalidTotalLost.into());
        }

        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | self.total_lost);
        buf.put_u32(self.last_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sender_report);
        buf.put_u32(self.delay);

        Ok(RECEPTION_REPORT_LENGTH)
    }
}

impl Unmarshal for ReceptionReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self, util::Error>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < RECEPTION_REPORT_LENGTH {
            return Err(Error::PacketTooShort.into());
        }

        let ssrc = raw_packet.get_u32();
        let lost = raw_packet.get_u32();

        Ok(ReceptionReport {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            total_lost: lost & MAX_TOTAL_LOST,
            last_sequence_number: raw_packet.get_u32(),
            jitter: raw_packet.get_u32(),
            last_sender_report: raw_packet.get_u32(),
            delay: raw_packet.get_u32(),
        })
    }
}

/// Reads `count` report blocks from the front of `raw_packet`.
pub(crate) fn unmarshal_reports<B: Buf>(
    raw_packet: &mut B,
    count: u8,
) -> Result<Vec<ReceptionReport>, util::Error> {
    if raw_packet.remaining() < count as usize * RECEPTION_REPORT_LENGTH {
        return Err(Error::PacketTooShort.into());
    }

    let mut reports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        reports.push(ReceptionReport::unmarshal(raw_packet)?);
    }
    Ok(reports)
}
