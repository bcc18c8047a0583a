use std::net::SocketAddr;

/// Metadata of one RTP packet, as handed over by the transport.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtpPacketInfo {
    pub ssrc: u32,
    pub sequence_number: u16,
    /// RTP timestamp
    pub timestamp: u32,
    pub marker: bool,
    pub payload_type: u8,
    pub payload_size: usize,
    /// Clock rate of the payload type, 0 when unknown. Jitter is only computed
    /// with a known clock rate.
    pub clock_rate: u32,
    /// Transport-wide sequence number from the header extension, if any.
    pub twcc_sequence_number: Option<u16>,
    /// Where the packet came from. None for locally produced packets.
    pub address: Option<SocketAddr>,
}
