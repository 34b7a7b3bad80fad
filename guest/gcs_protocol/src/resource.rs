// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Modify-settings resource requests.
//!
//! The `Settings` payload of a modify-settings message is opaque until the
//! `ResourceType` discriminator has been read, so decoding proceeds in two
//! phases: the outer envelope and the modification record are parsed with
//! `Settings` left raw, then the raw bytes are parsed against the record
//! selected by the discriminator.

use crate::messages::MessageBase;
use crate::messages::SpanContext;
use crate::serde_helpers::is_default;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use serde_json::value::RawValue;
use thiserror::Error;

/// The operation to perform on a resource. Defaults to `Add` when the host
/// omits the field.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum RequestType {
    #[default]
    Add,
    Remove,
    Update,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ScsiDevice {
    #[serde(skip_serializing_if = "is_default")]
    pub controller: u8,
    #[serde(skip_serializing_if = "is_default")]
    pub lun: u8,
}

/// A SCSI-attached disk to surface as a filesystem inside the guest.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct MappedVirtualDisk {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mount_path: String,
    #[serde(skip_serializing_if = "is_default")]
    pub lun: u8,
    #[serde(skip_serializing_if = "is_default")]
    pub controller: u8,
    #[serde(skip_serializing_if = "is_default")]
    pub partition: u64,
    #[serde(skip_serializing_if = "is_default")]
    pub read_only: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "is_default")]
    pub ensure_filesystem: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filesystem: String,
    #[serde(skip_serializing_if = "is_default")]
    pub block_dev: bool,
}

/// A host directory shared into the guest over virtio-9p.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct MappedDirectory {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mount_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub share_name: String,
    #[serde(skip_serializing_if = "is_default")]
    pub port: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub read_only: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct VpmemMappingInfo {
    #[serde(skip_serializing_if = "is_default")]
    pub device_offset_in_bytes: u64,
    #[serde(skip_serializing_if = "is_default")]
    pub device_size_in_bytes: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct VpmemDevice {
    #[serde(skip_serializing_if = "is_default")]
    pub device_number: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mount_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_info: Option<VpmemMappingInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct Layer {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// An overlay of read-only layers plus a scratch to compose a container root
/// filesystem.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct CombinedLayers {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_root_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Layer>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scratch_path: String,
    #[serde(rename = "ContainerID", skip_serializing_if = "String::is_empty")]
    pub container_id: String,
}

/// A network interface and its associated configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct NetworkAdapter {
    pub adapter_instance_id: String,
    pub firewall_enabled: bool,
    pub nat_enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub allocated_ip_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_ip_address: String,
    #[serde(skip_serializing_if = "is_default")]
    pub host_ip_prefix_length: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub allocated_ipv6_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_ipv6_address: String,
    #[serde(skip_serializing_if = "is_default")]
    pub host_ipv6_prefix_length: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_dns_server_list: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_dns_suffix: String,
    #[serde(skip_serializing_if = "is_default")]
    pub enable_low_metric: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub encap_overhead: u16,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct VpciDevice {
    #[serde(rename = "VMBusGUID", skip_serializing_if = "String::is_empty")]
    pub vmbus_guid: String,
}

/// OCI resource documents pass through unparsed; interpreting them is the
/// runtime's concern.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Box<RawValue>>,
}

impl Clone for ContainerConstraints {
    fn clone(&self) -> Self {
        Self {
            windows: self.windows.clone(),
            linux: self.linux.clone(),
        }
    }
}

impl PartialEq for ContainerConstraints {
    fn eq(&self, other: &Self) -> bool {
        fn raw(value: &Option<Box<RawValue>>) -> Option<&str> {
            value.as_deref().map(RawValue::get)
        }
        raw(&self.windows) == raw(&other.windows) && raw(&self.linux) == raw(&other.linux)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfidentialOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub enforcer_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub encoded_security_policy: String,
    #[serde(rename = "EncodedUVMReference", skip_serializing_if = "String::is_empty")]
    pub encoded_uvm_reference: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct PolicyFragment {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fragment: String,
}

/// The decoded `Settings` payload, keyed by the `ResourceType` discriminator.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceSettings {
    ScsiDevice(ScsiDevice),
    MappedVirtualDisk(MappedVirtualDisk),
    MappedDirectory(MappedDirectory),
    VpmemDevice(VpmemDevice),
    CombinedLayers(CombinedLayers),
    NetworkAdapter(NetworkAdapter),
    VpciDevice(VpciDevice),
    ContainerConstraints(ContainerConstraints),
    SecurityPolicy(ConfidentialOptions),
    PolicyFragment(PolicyFragment),
}

impl ResourceSettings {
    /// The wire value of the `ResourceType` discriminator for this settings
    /// record.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Self::ScsiDevice(_) => "SCSIDevice",
            Self::MappedVirtualDisk(_) => "MappedVirtualDisk",
            Self::MappedDirectory(_) => "MappedDirectory",
            Self::VpmemDevice(_) => "VPMemDevice",
            Self::CombinedLayers(_) => "CombinedLayers",
            Self::NetworkAdapter(_) => "Network",
            Self::VpciDevice(_) => "VPCIDevice",
            Self::ContainerConstraints(_) => "ContainerConstraints",
            Self::SecurityPolicy(_) => "SecurityPolicy",
            Self::PolicyFragment(_) => "SecurityPolicyFragment",
        }
    }
}

/// A fully decoded resource modification.
#[derive(Clone, Debug, PartialEq)]
pub struct ModificationRequest {
    pub request_type: RequestType,
    pub settings: ResourceSettings,
}

impl Serialize for ModificationRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Wire<'a, T> {
            resource_type: &'static str,
            request_type: RequestType,
            settings: &'a T,
        }

        fn wire<'a, T>(request: &'a ModificationRequest, settings: &'a T) -> Wire<'a, T> {
            Wire {
                resource_type: request.settings.resource_type(),
                request_type: request.request_type,
                settings,
            }
        }

        match &self.settings {
            ResourceSettings::ScsiDevice(s) => wire(self, s).serialize(serializer),
            ResourceSettings::MappedVirtualDisk(s) => wire(self, s).serialize(serializer),
            ResourceSettings::MappedDirectory(s) => wire(self, s).serialize(serializer),
            ResourceSettings::VpmemDevice(s) => wire(self, s).serialize(serializer),
            ResourceSettings::CombinedLayers(s) => wire(self, s).serialize(serializer),
            ResourceSettings::NetworkAdapter(s) => wire(self, s).serialize(serializer),
            ResourceSettings::VpciDevice(s) => wire(self, s).serialize(serializer),
            ResourceSettings::ContainerConstraints(s) => wire(self, s).serialize(serializer),
            ResourceSettings::SecurityPolicy(s) => wire(self, s).serialize(serializer),
            ResourceSettings::PolicyFragment(s) => wire(self, s).serialize(serializer),
        }
    }
}

/// The decoded modify-settings message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingsRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub request: ModificationRequest,
}

/// Failure to decode a modify-settings message. The partially decoded
/// [`MessageBase`] is retained where available so the response can still echo
/// the activity id.
#[derive(Debug, Error)]
pub enum ModifySettingsError {
    #[error("failed to unmarshal ContainerModifySettings")]
    Envelope(#[source] serde_json::Error),
    #[error("failed to unmarshal request as ModificationRequest")]
    Request {
        base: MessageBase,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to unmarshal settings as {resource_type}")]
    Settings {
        base: MessageBase,
        resource_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid ResourceType {resource_type:?}")]
    InvalidResourceType {
        base: MessageBase,
        resource_type: String,
    },
}

impl ModifySettingsError {
    pub fn base(&self) -> Option<&MessageBase> {
        match self {
            Self::Envelope(_) => None,
            Self::Request { base, .. }
            | Self::Settings { base, .. }
            | Self::InvalidResourceType { base, .. } => Some(base),
        }
    }
}

// Phase one: the outer envelope with `Request` left raw. Declared without the
// usual `MessageBase` flatten because raw values cannot be captured through a
// flattened struct.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default, rename = "ContainerId")]
    container_id: String,
    #[serde(default, rename = "ActivityId")]
    activity_id: String,
    #[serde(default, rename = "ocsc")]
    span_context: Option<SpanContext>,
    #[serde(rename = "Request")]
    request: Box<RawValue>,
}

// Phase two: the modification record with `Settings` left raw.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawModification {
    #[serde(default)]
    resource_type: String,
    #[serde(default)]
    request_type: Option<RequestType>,
    #[serde(default)]
    settings: Option<Box<RawValue>>,
}

/// Decodes a modify-settings payload, dispatching the `Settings` field on the
/// `ResourceType` discriminator.
pub fn decode_modify_settings(payload: &[u8]) -> Result<ModifySettingsRequest, ModifySettingsError> {
    let envelope: RawEnvelope =
        serde_json::from_slice(payload).map_err(ModifySettingsError::Envelope)?;
    let base = MessageBase {
        container_id: envelope.container_id,
        activity_id: envelope.activity_id,
        span_context: envelope.span_context,
    };

    let modification: RawModification = serde_json::from_str(envelope.request.get())
        .map_err(|source| ModifySettingsError::Request {
            base: base.clone(),
            source,
        })?;
    let request_type = modification.request_type.unwrap_or_default();
    let raw_settings = modification
        .settings
        .as_deref()
        .map(RawValue::get)
        .unwrap_or("{}");

    fn parse<T: serde::de::DeserializeOwned>(
        raw: &str,
        base: &MessageBase,
        resource_type: &'static str,
    ) -> Result<T, ModifySettingsError> {
        serde_json::from_str(raw).map_err(|source| ModifySettingsError::Settings {
            base: base.clone(),
            resource_type,
            source,
        })
    }

    let settings = match modification.resource_type.as_str() {
        "SCSIDevice" => {
            ResourceSettings::ScsiDevice(parse(raw_settings, &base, "SCSIDevice")?)
        }
        "MappedVirtualDisk" => ResourceSettings::MappedVirtualDisk(parse(
            raw_settings,
            &base,
            "MappedVirtualDisk",
        )?),
        "MappedDirectory" => {
            ResourceSettings::MappedDirectory(parse(raw_settings, &base, "MappedDirectory")?)
        }
        "VPMemDevice" => {
            ResourceSettings::VpmemDevice(parse(raw_settings, &base, "VPMemDevice")?)
        }
        "CombinedLayers" => {
            ResourceSettings::CombinedLayers(parse(raw_settings, &base, "CombinedLayers")?)
        }
        "Network" => {
            ResourceSettings::NetworkAdapter(parse(raw_settings, &base, "Network")?)
        }
        "VPCIDevice" => {
            ResourceSettings::VpciDevice(parse(raw_settings, &base, "VPCIDevice")?)
        }
        "ContainerConstraints" => ResourceSettings::ContainerConstraints(parse(
            raw_settings,
            &base,
            "ContainerConstraints",
        )?),
        "SecurityPolicy" => {
            ResourceSettings::SecurityPolicy(parse(raw_settings, &base, "SecurityPolicy")?)
        }
        "SecurityPolicyFragment" => ResourceSettings::PolicyFragment(parse(
            raw_settings,
            &base,
            "SecurityPolicyFragment",
        )?),
        other => {
            return Err(ModifySettingsError::InvalidResourceType {
                base,
                resource_type: other.to_string(),
            })
        }
    };

    Ok(ModifySettingsRequest {
        base,
        request: ModificationRequest {
            request_type,
            settings,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_defaults_to_add() {
        let payload = br#"{
            "ContainerId": "c1",
            "ActivityId": "a1",
            "Request": {
                "ResourceType": "MappedVirtualDisk",
                "Settings": {"MountPath": "/mnt/data", "Lun": 3, "ReadOnly": true}
            }
        }"#;
        let decoded = decode_modify_settings(payload).unwrap();
        assert_eq!(decoded.base.container_id, "c1");
        assert_eq!(decoded.request.request_type, RequestType::Add);
        match decoded.request.settings {
            ResourceSettings::MappedVirtualDisk(mvd) => {
                assert_eq!(mvd.mount_path, "/mnt/data");
                assert_eq!(mvd.lun, 3);
                assert!(mvd.read_only);
            }
            other => panic!("wrong settings variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_resource_type() {
        let payload = br#"{
            "ActivityId": "a1",
            "Request": {"ResourceType": "FloppyDisk", "Settings": {}}
        }"#;
        let err = decode_modify_settings(payload).unwrap_err();
        match &err {
            ModifySettingsError::InvalidResourceType { resource_type, .. } => {
                assert_eq!(resource_type, "FloppyDisk");
            }
            other => panic!("wrong error: {:?}", other),
        }
        assert_eq!(err.base().unwrap().activity_id, "a1");
    }

    #[test]
    fn bad_settings_keeps_activity_id() {
        let payload = br#"{
            "ActivityId": "a1",
            "Request": {"ResourceType": "Network", "Settings": 17}
        }"#;
        let err = decode_modify_settings(payload).unwrap_err();
        assert!(matches!(err, ModifySettingsError::Settings { .. }));
        assert_eq!(err.base().unwrap().activity_id, "a1");
    }

    fn all_settings() -> Vec<ResourceSettings> {
        vec![
            ResourceSettings::ScsiDevice(ScsiDevice {
                controller: 1,
                lun: 4,
            }),
            ResourceSettings::MappedVirtualDisk(MappedVirtualDisk {
                mount_path: "/mnt/scsi/0".to_string(),
                lun: 2,
                controller: 0,
                partition: 1,
                read_only: true,
                options: vec!["noatime".to_string(), "ro".to_string()],
                ..Default::default()
            }),
            ResourceSettings::MappedDirectory(MappedDirectory {
                mount_path: "/share".to_string(),
                port: 2049,
                read_only: false,
                ..Default::default()
            }),
            ResourceSettings::VpmemDevice(VpmemDevice {
                device_number: 2,
                mount_path: "/run/layers/1".to_string(),
                mapping_info: Some(VpmemMappingInfo {
                    device_offset_in_bytes: 4096,
                    device_size_in_bytes: 1 << 20,
                }),
            }),
            ResourceSettings::CombinedLayers(CombinedLayers {
                container_root_path: "/run/c1/rootfs".to_string(),
                layers: vec![Layer {
                    path: "/run/layers/0".to_string(),
                    ..Default::default()
                }],
                scratch_path: "/run/c1/scratch".to_string(),
                ..Default::default()
            }),
            ResourceSettings::NetworkAdapter(NetworkAdapter {
                adapter_instance_id: "6e264ab3".to_string(),
                allocated_ip_address: "10.0.0.2".to_string(),
                host_ip_address: "10.0.0.1".to_string(),
                host_ip_prefix_length: 24,
                ..Default::default()
            }),
            ResourceSettings::VpciDevice(VpciDevice {
                vmbus_guid: "f2d1c680".to_string(),
            }),
            ResourceSettings::ContainerConstraints(ContainerConstraints {
                linux: Some(
                    RawValue::from_string(r#"{"memory":{"limit":1024}}"#.to_string()).unwrap(),
                ),
                ..Default::default()
            }),
            ResourceSettings::SecurityPolicy(ConfidentialOptions {
                enforcer_type: "rego".to_string(),
                encoded_security_policy: "cGFja2FnZQ==".to_string(),
                ..Default::default()
            }),
            ResourceSettings::PolicyFragment(PolicyFragment {
                fragment: "ZnJhZ21lbnQ=".to_string(),
            }),
        ]
    }

    #[test]
    fn roundtrip_all_resource_types() {
        for settings in all_settings() {
            for request_type in [RequestType::Add, RequestType::Remove, RequestType::Update] {
                let msg = ModifySettingsRequest {
                    base: MessageBase {
                        container_id: "c1".to_string(),
                        activity_id: "a1".to_string(),
                        span_context: None,
                    },
                    request: ModificationRequest {
                        request_type,
                        settings: settings.clone(),
                    },
                };
                let bytes = serde_json::to_vec(&msg).unwrap();
                let decoded = decode_modify_settings(&bytes).unwrap();
                assert_eq!(msg, decoded, "roundtrip failed for {:?}", request_type);
            }
        }
    }

    #[test]
    fn network_adapter_field_spellings() {
        let adapter = NetworkAdapter {
            adapter_instance_id: "id".to_string(),
            allocated_ip_address: "10.0.0.2".to_string(),
            host_dns_server_list: "10.0.0.1".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&adapter).unwrap();
        assert_eq!(json["AdapterInstanceId"], "id");
        assert_eq!(json["AllocatedIpAddress"], "10.0.0.2");
        assert_eq!(json["HostDnsServerList"], "10.0.0.1");
    }
}
