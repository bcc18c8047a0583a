
use std::any::Any;
use std::fmt;

use bytes::{Buf, Bytes};
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::Error;
use crate::header::*;
use crate::packet::*;
use crate::receiver_report::*;
use crate::sender_report::*;
use crate::source_description::*;
use crate::util::*;

type Result<T> = std::result::Result<T, util::Error>;

/// A CompoundPacket is a collection of RTCP packets transmitted as a single packet with
/// the underlying protocol (for example UDP).
///
/// To maximize the resolution of reception statistics, the first Packet in a CompoundPacket
/// must always be either a SenderReport or a ReceiverReport.  This is true even if no data
/// has been sent or received, in which case an empty ReceiverReport must be sent, and even
/// if the only other RTCP packet in the compound packet is a Goodbye.
///
/// Next, a SourceDescription containing a CNAME item must be included in each CompoundPacket
/// to identify the source and to begin associating media for purposes such as lip-sync.
///
/// Other RTCP packet types may follow in any order. Packet types may appear more than once.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct CompoundPacket(pub Vec<Box<dyn Packet + Send + Sync>>);

impl fmt::Display for CompoundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.0 {
            writeln!(f, "{p}")?;
        }
        Ok(())
    }
}

impl Packet for CompoundPacket {
    fn header(&self) -> Header {
        Header::default()
    }

    /// destination_ssrc returns the synchronization sources associated with this
    /// CompoundPacket's reception report.
    fn destination_ssrc(&self) -> Vec<u32> {
        self.0
            .first()
            .map(|p| p.destination_ssrc())
            .unwrap_or_default()
    }

    fn raw_size(&self) -> usize {
        self.0.iter().map(|p| p.marshal_size()).sum()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<CompoundPacket>()
            .map_or(false, |a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for CompoundPacket {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        // align to 32-bit boundary
        l + get_padding_size(l)
    }
}

impl Marshal for CompoundPacket {
    /// Marshal encodes the CompoundPacket as binary, failing when it breaks the
    /// compound rules.
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        self.validate()?;

        for packet in &self.0 {
            let n = packet.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for CompoundPacket {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let mut packets = vec![];

        while raw_packet.has_remaining() {
            let p = unmarshaller(raw_packet)?;
            packets.push(p);
        }

        let c = CompoundPacket(packets);
        c.validate()?;

        Ok(c)
    }
}

impl CompoundPacket {
    fn is_report(p: &(dyn Packet + Send + Sync)) -> bool {
        p.as_any().downcast_ref::<SenderReport>().is_some()
            || p.as_any().downcast_ref::<ReceiverReport>().is_some()
    }

    /// Validate returns an error if this is not an RFC-compliant CompoundPacket.
    pub fn validate(&self) -> Result<()> {
        self.cname().map(|_| ())
    }

    /// CNAME returns the CNAME that *must* be present in every CompoundPacket.
    ///
    /// Only additional ReceiverReports may sit between the first report and the
    /// SourceDescription carrying it.
    pub fn cname(&self) -> Result<Bytes> {
        let first = match self.0.first() {
            Some(p) => p,
            None => return Err(Error::EmptyCompound.into()),
        };

        // SenderReport and ReceiverReport are the only types that
        // are allowed to be the first packet in a compound datagram
        if !Self::is_report(first.as_ref()) {
            return Err(Error::BadFirstPacket.into());
        }

        for pkt in &self.0[1..] {
            // If the number of ReceptionReports exceeds 31 additional ReceiverReports
            // can be included here.
            if pkt.as_any().downcast_ref::<ReceiverReport>().is_some() {
                continue;
            }

            let sdes = match pkt.as_any().downcast_ref::<SourceDescription>() {
                Some(sdes) => sdes,
                // Other packets are not permitted before the CNAME
                None => return Err(Error::PacketBeforeCname.into()),
            };

            return sdes
                .chunks
                .iter()
                .find_map(|c| c.item(SdesType::SdesCname))
                .cloned()
                .ok_or_else(|| Error::MissingCname.into());
        }

        // CNAME never reached
        Err(Error::MissingCname.into())
    }

    /// The SSRC of the first report, the source that sent this compound.
    pub fn sender_ssrc(&self) -> Option<u32> {
        let first = self.0.first()?;
        if let Some(sr) = first.as_any().downcast_ref::<SenderReport>() {
            Some(sr.ssrc)
        } else {
            first
                .as_any()
                .downcast_ref::<ReceiverReport>()
                .map(|rr| rr.ssrc)
        }
    }
}
