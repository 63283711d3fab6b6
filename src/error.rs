//! Error taxonomy shared by every subsystem (spec §7: kinds, not names).

use thiserror::Error;

/// Every failure mode the core can produce, grouped the way §7 groups them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // -- Transport --------------------------------------------------------
    #[error("link unavailable")]
    LinkUnavailable,
    #[error("channel busy (CCA)")]
    ChannelBusy,
    #[error("transmit timed out")]
    TxTimeout,
    #[error("RX CRC error")]
    RxCrcError,

    // -- Frame --------------------------------------------------------
    #[error("buffer shorter than header")]
    ShortBuffer,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("payload length mismatch")]
    LengthMismatch,
    #[error("integrity mismatch")]
    IntegrityMismatch,
    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),
    #[error("fragment reassembly timed out")]
    ReassemblyTimeout,

    // -- Crypto --------------------------------------------------------
    #[error("authentication failed")]
    AuthFail,
    #[error("nonce replay detected")]
    NonceReplay,
    #[error("nonce counter exhausted")]
    NonceExhausted,
    #[error("session key expired")]
    KeyExpired,
    #[error("no session key agreed")]
    KeyNotAgreed,

    // -- Protocol --------------------------------------------------------
    #[error("message addressed to a different target")]
    WrongTarget,
    #[error("permission denied")]
    PermissionDenied,
    #[error("frequency is full")]
    FrequencyFull,
    #[error("frequency is closed")]
    FrequencyClosed,
    #[error("wrong password")]
    WrongPassword,
    #[error("operation timed out")]
    Timeout,

    // -- Resource --------------------------------------------------------
    #[error("slot table is full")]
    ResourceExhausted,
    #[error("buffer overrun")]
    Overrun,
    #[error("buffer underrun")]
    Underrun,

    // -- Storage --------------------------------------------------------
    #[error("storage not mounted")]
    NotMounted,
    #[error("key not found")]
    NotFound,
    #[error("storage has no space")]
    NoSpace,
    #[error("storage IO error")]
    StorageIo,
}

/// The §7 top-level kind, for statistics bucketing without matching every
/// individual variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transport,
    Frame,
    Crypto,
    Protocol,
    Resource,
    Storage,
}

impl Error {
    /// Which §7 bucket this error belongs to, used by the statistics
    /// counters that make a rising error rate diagnosable (§7).
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            LinkUnavailable | ChannelBusy | TxTimeout | RxCrcError => ErrorClass::Transport,
            ShortBuffer | BadMagic | UnsupportedVersion | LengthMismatch | IntegrityMismatch
            | UnknownMessageKind(_) | ReassemblyTimeout => ErrorClass::Frame,
            AuthFail | NonceReplay | NonceExhausted | KeyExpired | KeyNotAgreed => {
                ErrorClass::Crypto
            }
            WrongTarget | PermissionDenied | FrequencyFull | FrequencyClosed | WrongPassword
            | Timeout => ErrorClass::Protocol,
            ResourceExhausted | Overrun | Underrun => ErrorClass::Resource,
            NotMounted | NotFound | NoSpace | StorageIo => ErrorClass::Storage,
        }
    }

    /// Whether the peer can reasonably diagnose this remotely, per §7's
    /// `MSG_ERROR` rule (auth-fail, frequency-full, wrong-password,
    /// unsupported-version only).
    pub fn is_remotely_reportable(&self) -> bool {
        matches!(
            self,
            Error::AuthFail | Error::FrequencyFull | Error::WrongPassword | Error::UnsupportedVersion
        )
    }
}
