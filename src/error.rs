//! Crate-wide error taxonomy.
//!
//! One variant per failure *kind* in the error-handling design, not one per
//! call site — callers match on kind to decide ack/nack/evict, not on the
//! message text.

use thiserror::Error;

/// A single CMS (SMS-related) error code reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmsErrorKind {
    /// Codes 23, 516 — payload string too long.
    PayloadTooLong,
    /// Codes 300, 301 — malformed or invalid destination.
    InvalidDestination,
    /// Code 500 — unspecified modem-side failure.
    Unspecified,
    /// Codes 29, 30 — PIN/PUK required.
    SimLocked,
    /// Any code not in the minimal mapping table.
    Unknown(u16),
}

impl CmsErrorKind {
    /// Classify a raw `+CMS ERROR: <n>` code per the mapping table in §4.3.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            23 | 516 => Self::PayloadTooLong,
            300 | 301 => Self::InvalidDestination,
            500 => Self::Unspecified,
            29 | 30 => Self::SimLocked,
            n => Self::Unknown(n),
        }
    }
}

impl std::fmt::Display for CmsErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLong => write!(f, "payload string too long"),
            Self::InvalidDestination => write!(f, "malformed or invalid destination"),
            Self::Unspecified => write!(f, "unspecified modem-side failure"),
            Self::SimLocked => write!(f, "PIN/PUK required"),
            Self::Unknown(n) => write!(f, "unknown CMS error {n}"),
        }
    }
}

/// Crate-wide error kind, covering transport, protocol, codec, pool and
/// consumer-pipeline failures.
#[derive(Debug, Error)]
pub enum SmsError {
    /// Discovery or open failed — the port does not exist or could not be
    /// acquired. Local recovery: skip the port.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// I/O error after a successful open. Fatal for the owning session; the
    /// pool evicts it.
    #[error("transport broken: {0}")]
    TransportBroken(String),

    /// The AT dialogue received an unexpected terminator (plain `ERROR`, a
    /// timeout, or garbage that never produced a recognized terminator).
    #[error("AT protocol error: {0}")]
    AtProtocol(String),

    /// The modem replied with `+CMS ERROR: <code>`.
    #[error("CMS error {code}: {kind}")]
    CmsError {
        /// Raw numeric code as reported by the modem.
        code: u16,
        /// Classified kind for the code.
        kind: CmsErrorKind,
    },

    /// The codec rejected the request before any AT dialogue began (e.g.
    /// empty body).
    #[error("encoding rejected: {0}")]
    EncodingRejected(String),

    /// No modem session was eligible at acquire time.
    #[error("no modem capacity available")]
    NoCapacity,

    /// The bus payload could not be decoded as UTF-8 JSON, or failed the
    /// `SmsRequest` invariants.
    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    /// Redelivery count reached the configured threshold.
    #[error("message poisoned after {0} redeliveries")]
    Poisoned(u32),

    /// The operation was cancelled at a suspension point (shutdown in
    /// progress). Carries no bus action — the bus will redeliver on its own.
    #[error("cancelled")]
    Cancelled,
}

impl SmsError {
    /// Increment the owning session's error counter per §4.4's failure
    /// policy? Only `AtProtocol` and `CmsError` do; this is a classification
    /// helper, not a mutation.
    #[must_use]
    pub fn counts_as_modem_error(&self) -> bool {
        matches!(self, Self::AtProtocol(_) | Self::CmsError { .. })
    }

    /// Whether the consumer pipeline should negative-ack the bus message for
    /// this outcome. Per §7's propagation policy, everything except
    /// `Cancelled` results in a nack (never a silent ack on failure).
    #[must_use]
    pub fn should_nack(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

pub type SmsResult<T> = Result<T, SmsError>;
