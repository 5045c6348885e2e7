use std::net::IpAddr;

use thiserror::Error;

/// Errors produced by the packet pipeline and its backing stores.
///
/// Datapath errors abort a single packet; control-plane tasks log transient
/// errors and keep running. `Config` errors are fatal at startup.
#[derive(Error, Debug)]
pub enum ZtpError {
    /// Invalid daemon configuration. Fatal at init.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unsupported IP version nibble or truncated packet.
    #[error("bad IP header: {0}")]
    BadHeader(String),

    /// A key needed for the packet could not be produced.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Per-peer nonce counter saturated; the key must be rotated.
    #[error("nonce counter exhausted, new key required")]
    NonceExhausted,

    /// AEAD open failed: wrong key or tampered ciphertext.
    #[error("packet authentication failed")]
    AuthFailed,

    /// Embedded timestamp outside the accepted clock-skew window.
    #[error("packet timestamp outside freshness window")]
    FreshnessFailed,

    /// Claimed source address is not owned by the delivering peer.
    #[error("source {src} is not behind delivering peer {remote_tp}")]
    SpoofedSource { src: IpAddr, remote_tp: String },

    /// The zone pair is not in the transition allow-set.
    #[error("transition from zone {from} to zone {to} not allowed")]
    TransitionDenied { from: u32, to: u32 },

    /// No subnet in the policy snapshot contains the address.
    #[error("no zone found for {0}")]
    ZoneNotFound(IpAddr),

    /// More than one subnet contains the address; overlapping policy.
    #[error("found {matches} subnets containing {ip}")]
    ZoneLookupAmbiguous { ip: IpAddr, matches: usize },

    /// Policy lookups before the first successful controller fetch.
    #[error("no policy snapshot available yet")]
    PolicyUnavailable,

    /// A fetch deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// Underlay or tunnel I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed wire payload (key service or controller).
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl ZtpError {
    /// Stable label used as the metrics bucket for dropped packets.
    pub fn kind(&self) -> &'static str {
        match self {
            ZtpError::Config(_) => "config",
            ZtpError::BadHeader(_) => "bad_header",
            ZtpError::KeyUnavailable(_) => "key_unavailable",
            ZtpError::NonceExhausted => "nonce_exhausted",
            ZtpError::AuthFailed => "auth_failed",
            ZtpError::FreshnessFailed => "freshness_failed",
            ZtpError::SpoofedSource { .. } => "spoofed_source",
            ZtpError::TransitionDenied { .. } => "transition_denied",
            ZtpError::ZoneNotFound(_) => "zone_not_found",
            ZtpError::ZoneLookupAmbiguous { .. } => "zone_ambiguous",
            ZtpError::PolicyUnavailable => "policy_unavailable",
            ZtpError::Timeout => "timeout",
            ZtpError::Transport(_) => "transport",
            ZtpError::Payload(_) => "payload",
        }
    }
}

/// Result type used throughout the datapath.
pub type Result<T> = std::result::Result<T, ZtpError>;
