//! Status codes returned by every service of the stack
//!
//! Nothing in the stack panics on bad input or unwinds on protocol failures.
//! Corrupt or unexpected packets are counted and released at the layer that
//! detects them; everything else is surfaced to the caller as an `NxError`.

use core::fmt;

/// Error status of a stack service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NxError {
    /// Control block identity mismatch (deleted or corrupted IP instance)
    PtrError,
    /// Object was never created or has already been deleted
    NotCreated,
    /// Invalid argument value
    InvalidParameters,
    /// Interface index out of range or interface not attached
    InvalidInterface,
    /// Packet pool exhausted
    NoPacket,
    /// Packet is malformed or does not fit the requested operation
    InvalidPacket,
    /// Requested offset lies outside the packet data
    PacketOffsetError,
    /// Not enough tailroom to append
    Overflow,
    /// Not enough headroom to prepend
    Underflow,
    /// Cache or table has no free slot
    NoMoreEntries,
    /// No matching cache or table entry
    EntryNotFound,
    /// Entry already exists
    DuplicateEntry,
    /// Address not reachable or not valid for this operation
    IpAddressError,
    /// Service was already enabled
    AlreadyEnabled,
    /// Service has not been enabled
    NotEnabled,
    /// Socket still bound or not closed
    StillBound,
    /// Socket is not bound to a port
    NotBound,
    /// Socket is already bound
    AlreadyBound,
    /// Port is owned by another socket
    PortUnavailable,
    /// No free port could be found
    NoFreePorts,
    /// Socket must be closed for this operation
    NotClosed,
    /// Socket is not connected
    NotConnected,
    /// Operation started and will complete asynchronously
    InProgress,
    /// Another listener already owns the port
    DuplicateListen,
    /// No listener on the port
    NotListenState,
    /// Waited for a reply that never arrived
    NoResponse,
    /// Suspension was aborted by instance teardown
    WaitAborted,
    /// Peer window or transmit queue is full
    WindowOverflow,
    /// Transmit queue depth reached
    TxQueueDepth,
    /// Link driver reported a failure
    DriverError,
    /// Feature not available on this build or interface
    NotSupported,
}

impl fmt::Display for NxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NxError::PtrError => "invalid control block",
            NxError::NotCreated => "object not created",
            NxError::InvalidParameters => "invalid parameters",
            NxError::InvalidInterface => "invalid interface",
            NxError::NoPacket => "packet pool exhausted",
            NxError::InvalidPacket => "invalid packet",
            NxError::PacketOffsetError => "packet offset out of range",
            NxError::Overflow => "packet overflow",
            NxError::Underflow => "packet underflow",
            NxError::NoMoreEntries => "no more entries",
            NxError::EntryNotFound => "entry not found",
            NxError::DuplicateEntry => "duplicate entry",
            NxError::IpAddressError => "ip address error",
            NxError::AlreadyEnabled => "already enabled",
            NxError::NotEnabled => "not enabled",
            NxError::StillBound => "socket still bound",
            NxError::NotBound => "socket not bound",
            NxError::AlreadyBound => "socket already bound",
            NxError::PortUnavailable => "port unavailable",
            NxError::NoFreePorts => "no free ports",
            NxError::NotClosed => "socket not closed",
            NxError::NotConnected => "socket not connected",
            NxError::InProgress => "operation in progress",
            NxError::DuplicateListen => "port already listening",
            NxError::NotListenState => "port not listening",
            NxError::NoResponse => "no response",
            NxError::WaitAborted => "wait aborted",
            NxError::WindowOverflow => "window overflow",
            NxError::TxQueueDepth => "transmit queue depth reached",
            NxError::DriverError => "link driver error",
            NxError::NotSupported => "not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NxError {}

/// Result alias used throughout the stack
pub type Result<T> = core::result::Result<T, NxError>;
