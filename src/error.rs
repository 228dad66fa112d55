use std::collections::TryReserveError;

use thiserror::Error;

use crate::{
    catalog::Role,
    event::{AttrHandle, AttrKind, GattStatus},
};

/// Failures of the protocol engine.
///
/// None of these are fatal: the session logs them and carries on, either by
/// dropping the affected message or by waiting for the next disconnect.
#[derive(Error, Debug)]
pub enum SppError {
    #[error("{op} failed with status {status}")]
    Connection { op: &'static str, status: GattStatus },

    #[error("attribute database has {found} elements, expected {expected}")]
    DiscoveryMismatch { expected: usize, found: usize },

    #[error("expected {role:?} attribute but found {kind:?} at handle {handle}")]
    UnexpectedAttribute {
        role: Role,
        kind: AttrKind,
        handle: AttrHandle,
    },

    #[error("service 0x{0:04x} not found on peer")]
    ServiceNotFound(u16),

    #[error("fragment sequence discontinuity, expected {expected} got {got}")]
    SequenceDiscontinuity { expected: u8, got: u8 },

    #[error("malformed fragment of {len} bytes")]
    MalformedFragment { len: usize },

    #[error("failed to allocate buffer: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("write to handle {handle} failed with status {status}")]
    WriteFailure { handle: AttrHandle, status: GattStatus },

    #[error("queue is full or closed")]
    QueueFull,

    #[error("no peer connected")]
    NotConnected,

    #[error("radio stack: {0}")]
    Stack(String),
}

pub type Result<T> = std::result::Result<T, SppError>;
