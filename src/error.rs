use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The datagram could not be parsed; it is dropped without touching state.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// TWCC feedback describing packets a newer feedback already reported.
    #[error("stale transport-wide feedback")]
    StaleFeedback,
    /// The SSRC is in use by another participant.
    #[error("ssrc {0:08x} collides with another source")]
    CollisionDetected(u32),
    /// Not everything fit in the packet; the rest waits for the next one.
    #[error("capacity exceeded, {0} entries deferred")]
    CapacityExceeded(usize),
    /// The transport refused a packet. The session stops its timer.
    #[error("state change failure: {0}")]
    StateChangeFailure(String),
    #[error("no rtcp scheduled yet")]
    NoRtcpScheduled,
    #[error("Invalid CloseRx Channel")]
    ErrInvalidCloseRx,
    #[error("session closed")]
    ErrClosed,
    #[error("invalid config: {0}")]
    ErrInvalidConfig(String),

    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<Error>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
