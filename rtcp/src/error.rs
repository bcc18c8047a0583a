use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Packet lost exceeds the 24-bit cumulative counter.
    #[error("Invalid total lost count")]
    InvalidTotalLost,
    /// Packet contains an invalid header.
    #[error("Invalid header")]
    InvalidHeader,
    /// Compound packet without any packet.
    #[error("Empty compound packet")]
    EmptyCompound,
    /// First packet of a compound must be SR or RR.
    #[error("First packet in compound must be SR or RR")]
    BadFirstPacket,
    #[error("Compound missing SourceDescription with CNAME")]
    MissingCname,
    #[error("Feedback packet seen before CNAME")]
    PacketBeforeCname,
    #[error("Too many reports")]
    TooManyReports,
    #[error("Too many chunks")]
    TooManyChunks,
    #[error("Too many sources")]
    TooManySources,
    #[error("Packet too short")]
    PacketTooShort,
    #[error("Buffer too short to be written")]
    BufferTooShort,
    #[error("Wrong packet type")]
    WrongType,
    #[error("SDES must be < 255 octets long")]
    SdesTextTooLong,
    #[error("SDES item missing type")]
    SdesMissingType,
    #[error("Reason must be < 255 octets long")]
    ReasonTooLong,
    #[error("Invalid packet version")]
    BadVersion,
    #[error("Invalid padding value")]
    WrongPadding,
    #[error("Header length is too small")]
    HeaderTooSmall,
    /// APP name must be exactly four ASCII characters.
    #[error("Application name must be 4 octets")]
    InvalidAppName,
    /// APP subtype only has five bits.
    #[error("Application subtype must be < 32")]
    InvalidAppSubtype,
    #[error("Application data must be a multiple of 4 octets")]
    InvalidAppDataLength,
    #[error("Invalid size or startIndex")]
    InvalidSizeOrStartIndex,
    /// Receive delta does not fit its symbol.
    #[error("Delta exceed limit")]
    DeltaExceedLimit,
    #[error("Packet status chunk must be 2 bytes")]
    PacketStatusChunkLength,
    /// Status count asks for more chunks or deltas than the packet holds.
    #[error("Packet status count exceeds packet")]
    PacketStatusCountExceeded,

    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}

impl From<Error> for util::Error {
    fn from(e: Error) -> Self {
        util::Error::from_std(e)
    }
}

impl PartialEq<util::Error> for Error {
    fn eq(&self, other: &util::Error) -> bool {
        if let Some(down) = other.downcast_ref::<Error>() {
            return self == down;
        }
        false
    }
}
