//! Crate-wide error type.
//!
//! The original C++ engine this crate is modeled on returns a bare `bool`
//! from most operations and stashes a human-readable string in
//! `last_error_text`. Here every fallible operation returns a typed
//! [`Error`] instead; [`Error`]'s `Display` impl is what channels cache as
//! their last-error text.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the channel engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter passed to an operation was invalid (bad dlc, unsupported
    /// bitrate, neither/both of Standard and Extended set, ...).
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The requested bitrate is not in the supported table, or is not
    /// realisable on this channel.
    #[error("unsupported bitrate {0} bit/s: not supported on this channel")]
    UnsupportedBitrate(u32),

    /// The channel was in the wrong state for the requested operation.
    #[error("channel {channel}: {reason}")]
    State {
        /// Channel index the error applies to.
        channel: u8,
        /// Human-readable reason.
        reason: String,
    },

    /// A blocking call did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// `send` was rejected because the in-flight transmit cap was reached
    /// and either no timeout was given or the timeout elapsed.
    #[error("transmit buffer overflow: {outstanding} requests already in flight")]
    TransmitBufferOverflow {
        /// Number of outstanding TX requests at the time of rejection.
        outstanding: u32,
    },

    /// The USB transport reported a failure while submitting a command or
    /// waiting for a synchronous reply.
    #[error("usb transport error: {0}")]
    Transport(String),

    /// A send failed partway through fragment submission and was rolled
    /// back.
    #[error("send failed: {0}")]
    SendError(String),

    /// No USB device matching the adapter's vendor/product id was found.
    #[error("no CAN adapter found")]
    DeviceNotFound,

    /// The device clock could not be read.
    #[error("failed to read device clock: {0}")]
    ClockRead(String),
}
