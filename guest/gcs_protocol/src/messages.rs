// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JSON payloads carried over the bridge. Field names, casing, and
//! `omitempty` behavior follow the HCS schema exactly; the notable
//! spellings (`ContainerId`, `ActivityId`, `ocsc`, `CreateInUtilityVM`)
//! are preserved via explicit renames where `PascalCase` is not enough.

use crate::serde_helpers::is_default;
use serde::Deserialize;
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::HashMap;

/// The OS type reported by a Linux GCS in its capabilities.
pub const OS_TYPE_LINUX: &str = "Linux";

/// `ContainerWaitForProcess::timeout_in_ms` value meaning no timeout.
pub const INFINITE_WAIT_TIMEOUT: u32 = 0xffff_ffff;

/// The tracing span context propagated by the host, if set when making the
/// request. Not formally part of the protocol: the JSON transport makes it a
/// purely additive field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpanContext {
    #[serde(rename = "TraceID", skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(rename = "SpanID", skip_serializing_if = "String::is_empty")]
    pub span_id: String,
    #[serde(rename = "TraceOptions", skip_serializing_if = "is_default")]
    pub trace_options: u32,
    #[serde(rename = "Tracestate", skip_serializing_if = "String::is_empty")]
    pub trace_state: String,
}

/// The base fields present in every message sent from the HCS to the GCS, as
/// well as [`ContainerNotification`] which travels the other way.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct MessageBase {
    pub container_id: String,
    pub activity_id: String,
    #[serde(rename = "ocsc", skip_serializing_if = "Option::is_none")]
    pub span_context: Option<SpanContext>,
}

/// Protocol range advertised by the host during negotiation. The string pair
/// is the legacy form; current hosts fill the numeric pair.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProtocolSupport {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub minimum_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub maximum_version: String,
    pub minimum_protocol_version: u32,
    pub maximum_protocol_version: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct NegotiateProtocol {
    #[serde(flatten)]
    pub base: MessageBase,
    pub minimum_version: u32,
    pub maximum_version: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerCreate {
    #[serde(flatten)]
    pub base: MessageBase,
    pub container_config: String,
    #[serde(skip_serializing_if = "is_default")]
    pub supported_versions: ProtocolSupport,
}

/// vsock port numbers for each stdio relay of a process.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecuteProcessVsockStdioRelaySettings {
    #[serde(rename = "StdIn", skip_serializing_if = "is_default")]
    pub std_in: u32,
    #[serde(rename = "StdOut", skip_serializing_if = "is_default")]
    pub std_out: u32,
    #[serde(rename = "StdErr", skip_serializing_if = "is_default")]
    pub std_err: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExecuteProcessSettings {
    pub process_parameters: String,
    pub vsock_stdio_relay_settings: ExecuteProcessVsockStdioRelaySettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerExecuteProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    pub settings: ExecuteProcessSettings,
}

/// The process document carried inside
/// [`ExecuteProcessSettings::process_parameters`]. Covers external utility VM
/// processes, container init processes (OCI spec present), and subsequent
/// container processes.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProcessParameters {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command_line: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command_args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(skip_serializing_if = "is_default")]
    pub emulate_console: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub create_std_in_pipe: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub create_std_out_pipe: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub create_std_err_pipe: bool,
    /// True for a process created external to any container.
    #[serde(rename = "CreateInUtilityVM", skip_serializing_if = "is_default")]
    pub is_external: bool,
    /// OCI runtime spec, passed through unparsed. Present only for the first
    /// process of a container.
    #[serde(rename = "OciSpecification", skip_serializing_if = "Option::is_none")]
    pub oci_specification: Option<Box<RawValue>>,
    #[serde(rename = "OciProcess", skip_serializing_if = "Option::is_none")]
    pub oci_process: Option<Box<RawValue>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerWaitForProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
    pub timeout_in_ms: u32,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignalProcessOptions {
    #[serde(rename = "Signal")]
    pub signal: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerSignalProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub options: SignalProcessOptions,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerResizeConsole {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerGetProperties {
    #[serde(flatten)]
    pub base: MessageBase,
    /// A JSON [`PropertyQuery`] document; empty means everything.
    pub query: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PropertyType {
    Memory,
    CpuGroup,
    Statistics,
    ProcessList,
    PendingUpdates,
    TerminateOnLastHandleClosed,
    MappedDirectory,
    #[serde(rename = "SystemGUID")]
    SystemGuid,
    Network,
    MappedPipe,
    MappedVirtualDisk,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct PropertyQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property_types: Vec<PropertyType>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProcessDetails {
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Properties {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub process_list: Vec<ProcessDetails>,
    /// cgroup metrics document, passed through unparsed.
    #[serde(rename = "LCOWMetrics", skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Box<RawValue>>,
}

/// The kind of event a [`ContainerNotification`] reports.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum NotificationType {
    None,
    GracefulExit,
    ForcedExit,
    UnexpectedExit,
    Reboot,
    Constructed,
    Started,
    Paused,
    #[default]
    Unknown,
}

/// The operation a notification is associated with.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ActiveOperation {
    #[default]
    None,
    Construct,
    Start,
    Pause,
    Resume,
    Shutdown,
    Terminate,
}

/// A guest-originated event pushed to the host outside the request/response
/// flow, framed with [`crate::MessageIdentifier::NOTIFICATION`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerNotification {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "Type")]
    pub notification_type: NotificationType,
    pub operation: ActiveOperation,
    pub result: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub result_info: String,
}

/// One structured error produced while handling a request. Nested failures
/// append a record each; the outermost handler emits them in call order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ErrorRecord {
    pub result: i32,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stack_trace: String,
    pub module_name: String,
    pub file_name: String,
    pub line: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub function_name: String,
}

impl ErrorRecord {
    #[track_caller]
    pub fn new(result: i32, message: String) -> Self {
        let location = std::panic::Location::caller();
        Self {
            result,
            message,
            module_name: "gcs".to_string(),
            file_name: location.file().to_string(),
            line: location.line(),
            ..Default::default()
        }
    }
}

/// The base fields of every response sent from the GCS back to the HCS.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct MessageResponseBase {
    pub result: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub activity_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_records: Vec<ErrorRecord>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct SchemaVersion {
    #[serde(skip_serializing_if = "is_default")]
    pub major: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub minor: u32,
}

/// Runtime-specific capabilities forwarded verbatim to HCS clients.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct GcsGuestCapabilities {
    #[serde(skip_serializing_if = "is_default")]
    pub namespace_add_request_supported: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub signal_process_supported: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub dump_stacks_supported: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub delete_container_state_supported: bool,
}

/// The abilities and scenarios supported by this GCS, reported in the
/// negotiation response.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct GcsCapabilities {
    #[serde(skip_serializing_if = "is_default")]
    pub send_host_create_message: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub send_host_start_message: bool,
    /// True if an HvSocket ModifySettings request should be sent immediately
    /// after the create/start messages, to configure the VM's Hyper-V socket
    /// addresses.
    #[serde(skip_serializing_if = "is_default")]
    pub hv_socket_config_on_startup: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_schema_versions: Vec<SchemaVersion>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub runtime_os_type: String,
    #[serde(skip_serializing_if = "is_default")]
    pub guest_defined_capabilities: GcsGuestCapabilities,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct NegotiateProtocolResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub version: u32,
    pub capabilities: GcsCapabilities,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub selected_version: String,
    pub selected_protocol_version: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerExecuteProcessResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
}

/// Only sent once the process has exited or the wait timed out.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerWaitForProcessResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub exit_code: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerGetPropertiesResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// A JSON [`Properties`] document.
    pub properties: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct DumpStacksResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub guest_stacks: String,
}
