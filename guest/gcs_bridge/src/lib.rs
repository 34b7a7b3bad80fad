// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The HCS<->GCS bridge.
//!
//! One [`Bridge`] serves one connection from the host compute service,
//! multiplexed over a single bidirectional byte stream: a reader leg consumes
//! length-framed requests, each accepted request runs as its own worker, and
//! a serialized writer leg emits responses (correlated by sequence id, in
//! completion order) interleaved with guest-originated notifications.
//!
//! The bridge mediates; it does not own containers or devices. Container
//! operations go to a [`ContainerRuntime`], resource mutations are first
//! cleared with a [`SecurityPolicy`], and SCSI disk mounts are routed to the
//! [`scsi_mount`] manager.

pub mod framing;

mod bridge;
mod error;
mod handlers;

pub use bridge::Bridge;
pub use bridge::BridgeNotifier;
pub use bridge::BridgeOptions;
pub use bridge::ConnectionState;
pub use bridge::NotifyError;
pub use error::FatalError;
pub use framing::FramingError;

use async_trait::async_trait;
use gcs_protocol::messages::ExecuteProcessSettings;
use gcs_protocol::messages::Properties;
use gcs_protocol::messages::PropertyQuery;
use gcs_protocol::messages::SignalProcessOptions;
use gcs_protocol::resource::ModificationRequest;
use gcs_protocol::resource::RequestType;
use thiserror::Error;

/// The container runtime the bridge dispatches to. Implementations own the
/// OCI containers and utility VM processes; the bridge only correlates
/// requests and renders outcomes onto the wire.
///
/// Errors are opaque; their cause chains are rendered into the response's
/// error records.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(&self, container_id: &str, config: &str) -> anyhow::Result<()>;

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()>;

    async fn shutdown_graceful(&self, container_id: &str) -> anyhow::Result<()>;

    async fn shutdown_forced(&self, container_id: &str) -> anyhow::Result<()>;

    /// Returns the pid of the created process.
    async fn execute_process(
        &self,
        container_id: &str,
        settings: ExecuteProcessSettings,
    ) -> anyhow::Result<u32>;

    /// Resolves with the exit code once the process exits. Callers apply
    /// their own timeout; dropping the future must not disturb the process.
    async fn wait_for_process(&self, process_id: u32) -> anyhow::Result<u32>;

    async fn signal_process(
        &self,
        process_id: u32,
        options: SignalProcessOptions,
    ) -> anyhow::Result<()>;

    async fn resize_console(&self, process_id: u32, height: u16, width: u16)
        -> anyhow::Result<()>;

    async fn get_properties(
        &self,
        container_id: &str,
        query: PropertyQuery,
    ) -> anyhow::Result<Properties>;

    /// Applies a resource modification the bridge does not handle itself
    /// (everything other than mapped virtual disks).
    async fn modify_settings(
        &self,
        container_id: &str,
        request: ModificationRequest,
    ) -> anyhow::Result<()>;

    async fn delete_container_state(&self, container_id: &str) -> anyhow::Result<()>;

    async fn dump_stacks(&self) -> anyhow::Result<String>;
}

/// Refusal from the [`SecurityPolicy`], rendered onto the wire as an
/// access-denied response without performing the mutation.
#[derive(Debug, Error)]
#[error("security policy denied {request_type:?} of {resource_type}: {reason}")]
pub struct PolicyDenial {
    pub resource_type: String,
    pub request_type: RequestType,
    pub reason: String,
}

/// Consulted before every resource mutation. The bridge treats this as an
/// opaque authorization oracle.
pub trait SecurityPolicy: Send + Sync {
    fn check_modify(&self, request: &ModificationRequest) -> Result<(), PolicyDenial>;
}

/// A policy that permits everything.
pub struct OpenDoorPolicy;

impl SecurityPolicy for OpenDoorPolicy {
    fn check_modify(&self, _request: &ModificationRequest) -> Result<(), PolicyDenial> {
        Ok(())
    }
}
