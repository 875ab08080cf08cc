//! Device address binding reports.
//!
//! Every time a GPU virtual range starts or stops backing an API object the
//! device tells the application's debug callback, if one was installed.

use std::sync::Arc;

use ember_core::{BufferMarker, Handle, MemoryMarker};

use crate::device::Device;

/// API buffer handle
pub type BufferHandle = Handle<BufferMarker>;
/// API memory handle
pub type MemoryHandle = Handle<MemoryMarker>;

/// Whether a range was mapped or unmapped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressBindingKind {
    /// Range now backs the object
    Bind,
    /// Range no longer backs the object
    Unbind,
}

/// Object a range belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoundObject {
    /// Driver-internal allocation
    Device,
    /// An API buffer
    Buffer(BufferHandle),
    /// An API memory allocation
    Memory(MemoryHandle),
}

/// One address binding event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressBindingReport {
    /// Owner of the range
    pub object: BoundObject,
    /// First byte
    pub address: u64,
    /// Length in bytes
    pub size: u64,
    /// Bind or unbind
    pub kind: AddressBindingKind,
}

/// Debug callback receiving address binding reports
pub type AddressBindingCallback = Arc<dyn Fn(&AddressBindingReport) + Send + Sync>;

impl Device {
    pub(crate) fn report_address_binding(
        &self,
        object: BoundObject,
        address: u64,
        size: u64,
        kind: AddressBindingKind,
    ) {
        if let Some(callback) = &self.address_binding_callback {
            callback(&AddressBindingReport {
                object,
                address,
                size,
                kind,
            });
        }
    }
}
