//! Crate-wide error type.
//!
//! Each layer (crypto, codec, session, transport, manager) defines its own
//! focused error enum; this type unifies them for callers that cross layer
//! boundaries (the session state machine, which drives both crypto and
//! codec).

use crate::{codec::CodecError, crypto::CryptoError, session::SessionError, transport::TransportError};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
