// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire protocol spoken between the host compute service (HCS) and the guest
//! compute service (GCS) running inside the utility VM.
//!
//! This crate defines the message identifier algebra, the fixed 16-byte
//! message header, and every JSON payload carried over the bridge. It
//! performs no I/O; framing and dispatch live in `gcs_bridge`.

pub mod messages;
pub mod resource;
mod serde_helpers;

use static_assertions::const_assert_eq;
use std::fmt;
use std::fmt::Debug;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::byteorder::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// Message identifiers are subdivided into various pieces of information:
//
// +---+----+-----+----+
// | T | CC | III | VV |
// +---+----+-----+----+
//
// T   - 4 bits    Type
// CC  - 8 bits    Category
// III - 12 bits   Message Id
// VV  - 8 bits    Version
const MESSAGE_TYPE_MASK: u32 = 0xF000_0000;
const MESSAGE_CATEGORY_MASK: u32 = 0x0FF0_0000;
const MESSAGE_ID_MASK: u32 = 0x000F_FF00;
const MESSAGE_VERSION_MASK: u32 = 0x0000_00FF;
const MESSAGE_ID_SHIFT: u32 = 8;

/// The type nibble of a [`MessageIdentifier`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const NONE: Self = Self(0);
    pub const REQUEST: Self = Self(0x1000_0000);
    pub const RESPONSE: Self = Self(0x2000_0000);
    pub const NOTIFICATION: Self = Self(0x3000_0000);
}

impl Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("None"),
            Self::REQUEST => f.write_str("Request"),
            Self::RESPONSE => f.write_str("Response"),
            Self::NOTIFICATION => f.write_str("Notification"),
            Self(other) => write!(f, "MessageType({:#010x})", other),
        }
    }
}

/// The category bits of a [`MessageIdentifier`]. Splitting the identifier
/// namespace lets similar messages route through common processing.
pub const CATEGORY_COMPUTE_SYSTEM: u32 = 0x0010_0000;

/// A packed message identifier, as carried in the first four bytes of every
/// frame. The concrete values below are part of the external ABI.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageIdentifier(pub u32);

impl MessageIdentifier {
    pub const NONE: Self = Self(0);

    pub const CREATE: Self = Self(0x1010_0101);
    pub const START: Self = Self(0x1010_0201);
    pub const SHUTDOWN_GRACEFUL: Self = Self(0x1010_0301);
    pub const SHUTDOWN_FORCED: Self = Self(0x1010_0401);
    pub const EXECUTE_PROCESS: Self = Self(0x1010_0501);
    pub const WAIT_FOR_PROCESS: Self = Self(0x1010_0601);
    pub const SIGNAL_PROCESS: Self = Self(0x1010_0701);
    pub const RESIZE_CONSOLE: Self = Self(0x1010_0801);
    pub const GET_PROPERTIES: Self = Self(0x1010_0901);
    pub const MODIFY_SETTINGS: Self = Self(0x1010_0a01);
    pub const NEGOTIATE_PROTOCOL: Self = Self(0x1010_0b01);
    pub const DUMP_STACKS: Self = Self(0x1010_0c01);
    pub const DELETE_CONTAINER_STATE: Self = Self(0x1010_0d01);

    /// Guest-originated container notification.
    pub const NOTIFICATION: Self = Self(0x3010_0101);

    pub const fn message_type(self) -> MessageType {
        MessageType(self.0 & MESSAGE_TYPE_MASK)
    }

    pub const fn category(self) -> u32 {
        self.0 & MESSAGE_CATEGORY_MASK
    }

    pub const fn message_id(self) -> u32 {
        (self.0 & MESSAGE_ID_MASK) >> MESSAGE_ID_SHIFT
    }

    pub const fn version(self) -> u8 {
        (self.0 & MESSAGE_VERSION_MASK) as u8
    }

    /// Returns the response identifier paired with this request identifier.
    /// Only the type nibble differs between a request and its response.
    pub const fn response(self) -> Self {
        Self(MessageType::RESPONSE.0 | (self.0 & !MESSAGE_TYPE_MASK))
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NONE => "None",
            Self::CREATE => "Create",
            Self::START => "Start",
            Self::SHUTDOWN_GRACEFUL => "ShutdownGraceful",
            Self::SHUTDOWN_FORCED => "ShutdownForced",
            Self::EXECUTE_PROCESS => "ExecuteProcess",
            Self::WAIT_FOR_PROCESS => "WaitForProcess",
            Self::SIGNAL_PROCESS => "SignalProcess",
            Self::RESIZE_CONSOLE => "ResizeConsole",
            Self::GET_PROPERTIES => "GetProperties",
            Self::MODIFY_SETTINGS => "ModifySettings",
            Self::NEGOTIATE_PROTOCOL => "NegotiateProtocol",
            Self::DUMP_STACKS => "DumpStacks",
            Self::DELETE_CONTAINER_STATE => "DeleteContainerState",
            Self::NOTIFICATION => "Notification",
            _ => return None,
        })
    }
}

impl Debug for MessageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            return f.write_str(name);
        }
        if self.message_type() == MessageType::RESPONSE {
            let request = MessageIdentifier(MessageType::REQUEST.0 | (self.0 & !MESSAGE_TYPE_MASK));
            if let Some(name) = request.name() {
                return write!(f, "Response{}", name);
            }
        }
        write!(f, "MessageIdentifier({:#010x})", self.0)
    }
}

/// Size in bytes of [`MessageHeader`] on the wire.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// The common header present on every frame. Little-endian wire order:
/// `[ID:u32][SIZE:u32][SEQ:u64]`. `size` is the total frame length,
/// header included.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    id: U32,
    size: U32,
    sequence_id: U64,
}

const_assert_eq!(MESSAGE_HEADER_SIZE, size_of::<MessageHeader>());

impl MessageHeader {
    pub fn new(id: MessageIdentifier, size: u32, sequence_id: u64) -> Self {
        Self {
            id: U32::new(id.0),
            size: U32::new(size),
            sequence_id: U64::new(sequence_id),
        }
    }

    pub fn id(&self) -> MessageIdentifier {
        MessageIdentifier(self.id.get())
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    /// The sequence identifier correlating a response to its request. Chosen
    /// by the host for requests and echoed verbatim in the paired response;
    /// guest-originated notifications carry their own identifiers.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id.get()
    }
}

/// The HCS<->GCS protocol version selected during negotiation.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    pub const INVALID: Self = Self(0);
    pub const V4: Self = Self(4);
    pub const MAX: Self = Self::V4;
}

impl Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => f.write_str("Invalid"),
            Self::V4 => f.write_str("V4"),
            Self(other) => write!(f, "ProtocolVersion({})", other),
        }
    }
}

/// An HRESULT-shaped result code, carried in the `Result` field of every
/// response and error record. Zero is success. The nonzero values are drawn
/// from the standard COM/Win32 codes and the VMCOMPUTE facility table the
/// host already understands.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Hresult(pub i32);

impl Hresult {
    pub const OK: Self = Self(0);
    pub const E_NOTIMPL: Self = Self(0x8000_4001_u32 as i32);
    pub const E_FAIL: Self = Self(0x8000_4005_u32 as i32);
    pub const E_ACCESSDENIED: Self = Self(0x8007_0005_u32 as i32);
    pub const E_INVALIDARG: Self = Self(0x8007_0057_u32 as i32);
    pub const ERROR_ALREADY_EXISTS: Self = Self(0x8007_00b7_u32 as i32);
    pub const ERROR_NOT_FOUND: Self = Self(0x8007_0490_u32 as i32);
    pub const ERROR_CANCELLED: Self = Self(0x8007_04c7_u32 as i32);
    pub const HCS_E_INVALID_STATE: Self = Self(0x8037_0105_u32 as i32);
    pub const HCS_E_CONNECTION_TIMEOUT: Self = Self(0x8037_0108_u32 as i32);
    pub const HCS_E_UNKNOWN_MESSAGE: Self = Self(0x8037_010a_u32 as i32);
    pub const HCS_E_UNSUPPORTED_PROTOCOL_VERSION: Self = Self(0x8037_010b_u32 as i32);
    pub const HCS_E_INVALID_JSON: Self = Self(0x8037_010c_u32 as i32);
    pub const HCS_E_SYSTEM_NOT_FOUND: Self = Self(0x8037_010d_u32 as i32);
    pub const HCS_E_PROTOCOL_ERROR: Self = Self(0x8037_0110_u32 as i32);

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl Debug for Hresult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hresult({:#010x})", self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    #[test]
    fn identifier_fields() {
        let id = MessageIdentifier::NEGOTIATE_PROTOCOL;
        assert_eq!(id.message_type(), MessageType::REQUEST);
        assert_eq!(id.category(), CATEGORY_COMPUTE_SYSTEM);
        assert_eq!(id.message_id(), 0x00b);
        assert_eq!(id.version(), 0x01);
    }

    #[test]
    fn response_identifier_values() {
        assert_eq!(
            MessageIdentifier::NEGOTIATE_PROTOCOL.response(),
            MessageIdentifier(0x2010_0b01)
        );
        assert_eq!(
            MessageIdentifier::CREATE.response(),
            MessageIdentifier(0x2010_0101)
        );
    }

    #[test]
    fn header_wire_layout() {
        let header = MessageHeader::new(MessageIdentifier::NEGOTIATE_PROTOCOL, 0x2a, 1);
        assert_eq!(
            header.as_bytes(),
            [
                0x01, 0x0b, 0x10, 0x10, // identifier, little endian
                0x2a, 0x00, 0x00, 0x00, // size
                0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // sequence id
            ]
        );
    }

    proptest! {
        #[test]
        fn header_roundtrip(id: u32, size: u32, sequence_id: u64) {
            let header = MessageHeader::new(MessageIdentifier(id), size, sequence_id);
            let decoded = MessageHeader::read_from_bytes(header.as_bytes()).unwrap();
            prop_assert_eq!(header, decoded);
        }

        #[test]
        fn response_preserves_lower_bits(raw: u32) {
            let response = MessageIdentifier(raw).response();
            prop_assert_eq!(response.message_type(), MessageType::RESPONSE);
            prop_assert_eq!(response.0 & !MESSAGE_TYPE_MASK, raw & !MESSAGE_TYPE_MASK);
        }
    }
}
