// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers for matching the HCS schema's `omitempty` marshaling.

pub(crate) fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}
