// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-request workers.
//!
//! Every accepted request runs as one worker future: decode the payload,
//! execute against the collaborators, compose a response echoing the
//! request's activity id and sequence id. Workers never touch the transport
//! directly; responses go through the bridge's serialized outbound queue.

use crate::ContainerRuntime;
use crate::SecurityPolicy;
use gcs_protocol::messages::ContainerCreate;
use gcs_protocol::messages::ContainerCreateResponse;
use gcs_protocol::messages::ContainerExecuteProcess;
use gcs_protocol::messages::ContainerExecuteProcessResponse;
use gcs_protocol::messages::ContainerGetProperties;
use gcs_protocol::messages::ContainerGetPropertiesResponse;
use gcs_protocol::messages::ContainerResizeConsole;
use gcs_protocol::messages::ContainerSignalProcess;
use gcs_protocol::messages::ContainerWaitForProcess;
use gcs_protocol::messages::ContainerWaitForProcessResponse;
use gcs_protocol::messages::DumpStacksResponse;
use gcs_protocol::messages::ErrorRecord;
use gcs_protocol::messages::MessageBase;
use gcs_protocol::messages::MessageResponseBase;
use gcs_protocol::messages::PropertyQuery;
use gcs_protocol::messages::INFINITE_WAIT_TIMEOUT;
use gcs_protocol::resource::decode_modify_settings;
use gcs_protocol::resource::MappedVirtualDisk;
use gcs_protocol::resource::ModifySettingsError;
use gcs_protocol::resource::ModifySettingsRequest;
use gcs_protocol::resource::RequestType;
use gcs_protocol::resource::ResourceSettings;
use gcs_protocol::Hresult;
use gcs_protocol::MessageHeader;
use gcs_protocol::MessageIdentifier;
use gcs_protocol::ProtocolVersion;
use scsi_mount::MountConfig;
use scsi_mount::MountError;
use scsi_mount::MountManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A frame queued for the writer leg.
pub(crate) struct OutboundFrame {
    pub id: MessageIdentifier,
    pub sequence_id: u64,
    pub payload: Vec<u8>,
}

/// Worker-to-dispatcher signals that drive the connection state machine.
pub(crate) enum BridgeEvent {
    ContainerCreated,
    ShutdownResponded,
}

/// Everything a worker needs, cloned per request.
pub(crate) struct RequestEnv {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub policy: Arc<dyn SecurityPolicy>,
    pub mounts: Arc<MountManager>,
    pub out: mpsc::Sender<OutboundFrame>,
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    pub cancel: CancellationToken,
    pub version: ProtocolVersion,
}

/// A recovered handler failure: an HRESULT for the envelope plus the cause
/// chain for the error records.
pub(crate) struct HandlerFailure {
    code: Hresult,
    error: anyhow::Error,
}

impl HandlerFailure {
    pub(crate) fn new(code: Hresult, error: anyhow::Error) -> Self {
        Self { code, error }
    }

    fn internal(error: anyhow::Error) -> Self {
        Self::new(Hresult::E_FAIL, error)
    }

    fn cancelled() -> Self {
        Self::new(
            Hresult::ERROR_CANCELLED,
            anyhow::anyhow!("operation cancelled by connection teardown"),
        )
    }
}

impl From<MountError> for HandlerFailure {
    fn from(err: MountError) -> Self {
        let code = match &err {
            MountError::PathConflict(_) => Hresult::ERROR_ALREADY_EXISTS,
            MountError::NotMounted(_) => Hresult::ERROR_NOT_FOUND,
            MountError::Cancelled => Hresult::ERROR_CANCELLED,
            MountError::Mount { .. } | MountError::Unmount { .. } => Hresult::E_FAIL,
        };
        Self::new(code, anyhow::Error::new(err))
    }
}

/// Leniently recovers the base fields from a payload that may not decode as
/// its full message type, so error responses can still echo the activity id.
pub(crate) fn partial_base(payload: &[u8]) -> MessageBase {
    serde_json::from_slice(payload).unwrap_or_default()
}

/// Composes the response base: `Result` is the first failure's code, the
/// cause chain becomes the error records in call order.
pub(crate) fn response_base(
    activity_id: &str,
    result: Result<(), HandlerFailure>,
) -> MessageResponseBase {
    match result {
        Ok(()) => MessageResponseBase {
            activity_id: activity_id.to_string(),
            ..Default::default()
        },
        Err(failure) => MessageResponseBase {
            result: failure.code.0,
            activity_id: activity_id.to_string(),
            error_message: format!("{:#}", failure.error),
            error_records: failure
                .error
                .chain()
                .map(|cause| ErrorRecord::new(failure.code.0, cause.to_string()))
                .collect(),
        },
    }
}

pub(crate) fn encode<T: Serialize>(response: &T) -> Vec<u8> {
    serde_json::to_vec(response).unwrap()
}

// Decode failures are recovered: the pre-encoded invalid-JSON response is
// returned for the worker to emit as-is.
fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Vec<u8>> {
    serde_json::from_slice(payload).map_err(|err| {
        let base = partial_base(payload);
        encode(&response_base(
            &base.activity_id,
            Err(HandlerFailure::new(
                Hresult::HCS_E_INVALID_JSON,
                anyhow::Error::new(err),
            )),
        ))
    })
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, HandlerFailure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HandlerFailure::cancelled()),
        res = operation => res.map_err(HandlerFailure::internal),
    }
}

/// Runs one request to completion and queues its response.
pub(crate) async fn run_request(env: RequestEnv, header: MessageHeader, payload: Vec<u8>) {
    let id = header.id();
    let base = partial_base(&payload);
    let span = tracing::info_span!(
        "request",
        message = ?id,
        sequence_id = header.sequence_id(),
        activity_id = %base.activity_id,
    );
    let response = dispatch(&env, id, &payload).instrument(span).await;
    let _ = env
        .out
        .send(OutboundFrame {
            id: id.response(),
            sequence_id: header.sequence_id(),
            payload: response,
        })
        .await;
}

async fn dispatch(env: &RequestEnv, id: MessageIdentifier, payload: &[u8]) -> Vec<u8> {
    match id {
        MessageIdentifier::CREATE => create(env, payload).await,
        MessageIdentifier::START => start(env, payload).await,
        MessageIdentifier::SHUTDOWN_GRACEFUL => shutdown(env, payload, true).await,
        MessageIdentifier::SHUTDOWN_FORCED => shutdown(env, payload, false).await,
        MessageIdentifier::EXECUTE_PROCESS => execute_process(env, payload).await,
        MessageIdentifier::WAIT_FOR_PROCESS => wait_for_process(env, payload).await,
        MessageIdentifier::SIGNAL_PROCESS => signal_process(env, payload).await,
        MessageIdentifier::RESIZE_CONSOLE => resize_console(env, payload).await,
        MessageIdentifier::GET_PROPERTIES => get_properties(env, payload).await,
        MessageIdentifier::MODIFY_SETTINGS => modify_settings(env, payload).await,
        MessageIdentifier::DUMP_STACKS => dump_stacks(env, payload).await,
        MessageIdentifier::DELETE_CONTAINER_STATE => delete_container_state(env, payload).await,
        other => encode(&response_base(
            &partial_base(payload).activity_id,
            Err(HandlerFailure::new(
                Hresult::HCS_E_UNKNOWN_MESSAGE,
                anyhow::anyhow!("no handler for {:?}", other),
            )),
        )),
    }
}

async fn create(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerCreate = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime
            .create_container(&req.base.container_id, &req.container_config),
    )
    .await;
    if result.is_ok() {
        let _ = env.events.send(BridgeEvent::ContainerCreated);
    }
    encode(&ContainerCreateResponse {
        base: response_base(&req.base.activity_id, result),
        selected_protocol_version: env.version.0,
        ..Default::default()
    })
}

async fn start(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: MessageBase = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(&env.cancel, env.runtime.start_container(&req.container_id)).await;
    encode(&response_base(&req.activity_id, result))
}

async fn shutdown(env: &RequestEnv, payload: &[u8], graceful: bool) -> Vec<u8> {
    let req: MessageBase = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let operation = async {
        if graceful {
            env.runtime.shutdown_graceful(&req.container_id).await
        } else {
            env.runtime.shutdown_forced(&req.container_id).await
        }
    };
    let result = with_cancel(&env.cancel, operation).await;
    if result.is_ok() {
        let _ = env.events.send(BridgeEvent::ShutdownResponded);
    }
    encode(&response_base(&req.activity_id, result))
}

async fn execute_process(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerExecuteProcess = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime
            .execute_process(&req.base.container_id, req.settings),
    )
    .await;
    match result {
        Ok(process_id) => encode(&ContainerExecuteProcessResponse {
            base: response_base(&req.base.activity_id, Ok(())),
            process_id,
        }),
        Err(failure) => encode(&ContainerExecuteProcessResponse {
            base: response_base(&req.base.activity_id, Err(failure)),
            process_id: 0,
        }),
    }
}

// The response is withheld until the process exits or the timeout elapses.
// This runs as its own worker, so the withheld response never blocks the
// read loop.
async fn wait_for_process(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerWaitForProcess = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let wait = env.runtime.wait_for_process(req.process_id);
    let result = tokio::select! {
        _ = env.cancel.cancelled() => Err(HandlerFailure::cancelled()),
        res = async {
            if req.timeout_in_ms == INFINITE_WAIT_TIMEOUT {
                Ok(wait.await)
            } else {
                tokio::time::timeout(Duration::from_millis(req.timeout_in_ms.into()), wait).await
            }
        } => match res {
            Ok(Ok(exit_code)) => Ok(exit_code),
            Ok(Err(err)) => Err(HandlerFailure::new(Hresult::HCS_E_SYSTEM_NOT_FOUND, err)),
            Err(_) => Err(HandlerFailure::new(
                Hresult::HCS_E_CONNECTION_TIMEOUT,
                anyhow::anyhow!(
                    "wait for process {} timed out after {}ms",
                    req.process_id,
                    req.timeout_in_ms
                ),
            )),
        },
    };
    match result {
        Ok(exit_code) => encode(&ContainerWaitForProcessResponse {
            base: response_base(&req.base.activity_id, Ok(())),
            exit_code,
        }),
        Err(failure) => encode(&ContainerWaitForProcessResponse {
            base: response_base(&req.base.activity_id, Err(failure)),
            exit_code: 0,
        }),
    }
}

async fn signal_process(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerSignalProcess = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime.signal_process(req.process_id, req.options),
    )
    .await;
    encode(&response_base(&req.base.activity_id, result))
}

async fn resize_console(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerResizeConsole = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime
            .resize_console(req.process_id, req.height, req.width),
    )
    .await;
    encode(&response_base(&req.base.activity_id, result))
}

async fn get_properties(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: ContainerGetProperties = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let query: PropertyQuery = if req.query.is_empty() {
        PropertyQuery::default()
    } else {
        match serde_json::from_str(&req.query) {
            Ok(query) => query,
            Err(err) => {
                return encode(&response_base(
                    &req.base.activity_id,
                    Err(HandlerFailure::new(
                        Hresult::HCS_E_INVALID_JSON,
                        anyhow::Error::new(err).context("failed to unmarshal PropertyQuery"),
                    )),
                ))
            }
        }
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime.get_properties(&req.base.container_id, query),
    )
    .await;
    match result {
        Ok(properties) => encode(&ContainerGetPropertiesResponse {
            base: response_base(&req.base.activity_id, Ok(())),
            properties: serde_json::to_string(&properties).unwrap(),
        }),
        Err(failure) => encode(&ContainerGetPropertiesResponse {
            base: response_base(&req.base.activity_id, Err(failure)),
            properties: String::new(),
        }),
    }
}

async fn modify_settings(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req = match decode_modify_settings(payload) {
        Ok(req) => req,
        Err(err) => {
            let activity_id = err
                .base()
                .map(|base| base.activity_id.clone())
                .unwrap_or_else(|| partial_base(payload).activity_id);
            let code = match &err {
                ModifySettingsError::InvalidResourceType { .. } => Hresult::E_INVALIDARG,
                _ => Hresult::HCS_E_INVALID_JSON,
            };
            return encode(&response_base(
                &activity_id,
                Err(HandlerFailure::new(code, anyhow::Error::new(err))),
            ));
        }
    };

    let activity_id = req.base.activity_id.clone();
    if let Err(denial) = env.policy.check_modify(&req.request) {
        tracing::warn!(denial = %denial, "security policy denied modification");
        return encode(&response_base(
            &activity_id,
            Err(HandlerFailure::new(
                Hresult::E_ACCESSDENIED,
                anyhow::Error::new(denial),
            )),
        ));
    }

    let result = apply_modification(env, req).await;
    encode(&response_base(&activity_id, result))
}

async fn apply_modification(
    env: &RequestEnv,
    req: ModifySettingsRequest,
) -> Result<(), HandlerFailure> {
    match req.request.settings {
        // SCSI disk mounts are owned by the mount manager; everything else
        // passes through to the runtime.
        ResourceSettings::MappedVirtualDisk(ref disk) => match req.request.request_type {
            RequestType::Add => {
                let path =
                    (!disk.mount_path.is_empty()).then(|| Path::new(disk.mount_path.as_str()));
                env.mounts
                    .mount(
                        &env.cancel,
                        disk.controller.into(),
                        disk.lun.into(),
                        path,
                        mount_config(disk),
                    )
                    .await
                    .map(|_| ())
                    .map_err(HandlerFailure::from)
            }
            RequestType::Remove => env
                .mounts
                .unmount(&env.cancel, Path::new(disk.mount_path.as_str()))
                .await
                .map_err(HandlerFailure::from),
            RequestType::Update => Err(HandlerFailure::new(
                Hresult::E_NOTIMPL,
                anyhow::anyhow!("update of a mapped virtual disk is not supported"),
            )),
        },
        _ => {
            with_cancel(
                &env.cancel,
                env.runtime
                    .modify_settings(&req.base.container_id, req.request),
            )
            .await
        }
    }
}

fn mount_config(disk: &MappedVirtualDisk) -> MountConfig {
    MountConfig {
        partition: disk.partition,
        read_only: disk.read_only,
        encrypted: disk.encrypted,
        block_dev: disk.block_dev,
        options: disk.options.clone(),
        ensure_filesystem: disk.ensure_filesystem,
        filesystem: disk.filesystem.clone(),
    }
}

async fn dump_stacks(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: MessageBase = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(&env.cancel, env.runtime.dump_stacks()).await;
    match result {
        Ok(guest_stacks) => encode(&DumpStacksResponse {
            base: response_base(&req.activity_id, Ok(())),
            guest_stacks,
        }),
        Err(failure) => encode(&DumpStacksResponse {
            base: response_base(&req.activity_id, Err(failure)),
            guest_stacks: String::new(),
        }),
    }
}

async fn delete_container_state(env: &RequestEnv, payload: &[u8]) -> Vec<u8> {
    let req: MessageBase = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = with_cancel(
        &env.cancel,
        env.runtime.delete_container_state(&req.container_id),
    )
    .await;
    encode(&response_base(&req.activity_id, result))
}
