//! Node-level errors

use crate::storage::StorageError;
use crate::transport::TransportError;
use shared::{OpCode, OwnerId, PeerId, ProfileError};
use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no profile loaded for owner {0}")]
    UnknownOwner(OwnerId),
    #[error("unexpected {op:?} message from peer {peer}")]
    UnexpectedMessage { op: OpCode, peer: PeerId },
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
