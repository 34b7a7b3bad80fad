// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::framing::FramingError;
use gcs_protocol::MessageIdentifier;
use thiserror::Error;

/// Errors that terminate the connection. Everything else is recovered
/// locally and reported to the host in a response.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("transport read failed")]
    Read(#[source] FramingError),
    #[error("transport write failed")]
    Write(#[source] std::io::Error),
    #[error("{0:?} received before protocol negotiation")]
    ProtocolViolation(MessageIdentifier),
    #[error("malformed protocol negotiation request")]
    Negotiation(#[source] serde_json::Error),
}
