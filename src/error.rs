use crate::endpoint::{EpAddr, EpState};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Not enough free slots on the ring for the requested element count.
    NoRoom,
    /// Operation not allowed while the endpoint is in this state.
    InvalidState(EpState),
    UnknownEndpoint(EpAddr),
    EndpointExists(EpAddr),
    /// Device context index must be 1..=31.
    InvalidEndpointAddress(EpAddr),
    TooManyEndpoints,
    /// Internal command pool exhausted; a guaranteed command cannot be queued.
    NoReservation,
    /// Command completion does not point at the software dequeue position.
    CommandRingDesync { expected: u64, reported: u64 },
    /// Transfer event points outside every in-flight TD on the endpoint.
    TdNotFound { dma: u64 },
    /// TRB read back from ring memory has no valid typed representation.
    UnexpectedTrbContent([u32; 4]),
    /// Dequeue recovery walked the whole ring without finding the stop point.
    RecoveryWalkFailed,
    ControllerDead,
}

impl From<Error> for anyhow::Error {
    fn from(e: Error) -> Self {
        anyhow::anyhow!("xhci ring error: {e:?}")
    }
}
