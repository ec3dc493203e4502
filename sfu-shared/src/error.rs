use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTCP errors
    /// Packet lost exceeds maximum amount of packets
    /// that can possibly be lost.
    #[error("Invalid total lost count")]
    InvalidTotalLost,
    /// Packet contains an invalid header.
    #[error("Invalid header")]
    InvalidHeader,
    /// Too many reports.
    #[error("Too many reports")]
    TooManyReports,
    /// Packet received is too short.
    #[error("Packet too short to be read")]
    PacketTooShort,
    /// Buffer is too short.
    #[error("Buffer too short to be written")]
    BufferTooShort,
    /// Wrong packet type.
    #[error("Wrong packet type")]
    WrongType,
    /// Invalid packet version.
    #[error("Invalid packet version")]
    BadVersion,
    /// Invalid padding value.
    #[error("Invalid padding value")]
    WrongPadding,
    /// Declared block length runs past the end of the buffer.
    #[error("RTCP block length exceeds buffer")]
    BlockLengthOverrun,

    //RTP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("too many CSRC entries")]
    ErrTooManyCsrcs,

    //Pipeline errors
    #[error("service already registered: {0}")]
    ErrServiceAlreadyRegistered(&'static str),
    #[error("handler not found")]
    ErrHandlerNotFound,
    #[error("unknown handler: {0}")]
    ErrUnknownHandler(String),
    #[error("pipeline is closed")]
    ErrPipelineClosed,
    #[error("reassembly overflow: {needed} bytes exceeds capacity {capacity}")]
    ErrReassemblyOverflow { needed: usize, capacity: usize },

    //Other Errors
    #[error("{0}")]
    Other(String),
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
