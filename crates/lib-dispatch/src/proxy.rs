//! Address proxying between the host and sink domains.
//!
//! Host buffers become visible to sink functions only through explicit
//! registration. A registration yields a [`ProxyHandle`]; the marshaler
//! turns handles into sink-visible addresses at call time. Handles carry a
//! generation so that a handle kept past `unregister` fails instead of
//! resolving to whatever buffer later reuses the slot.

use crate::error::{DispatchError, DispatchResult};
use crate::sync::RecoverMutex;
use lib_types::{ArgValue, ProxyHandle};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Translation from host addresses to sink-visible addresses.
///
/// Implemented by transports. The host-side transport runs sink functions in
/// the host process, so its mapping is the identity.
pub trait AddressSpace: Send + Sync + fmt::Debug {
    /// Make `length` bytes at `host_address` visible to the sink and return
    /// the address sink code should use.
    fn map(&self, host_address: usize, length: usize) -> DispatchResult<u64>;

    /// Revoke a mapping produced by [`AddressSpace::map`].
    fn unmap(&self, _sink_address: u64, _length: usize) {}
}

/// Identity mapping for sinks that share the host address space.
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedAddressSpace;

impl AddressSpace for SharedAddressSpace {
    fn map(&self, host_address: usize, _length: usize) -> DispatchResult<u64> {
        Ok(host_address as u64)
    }
}

/// A live registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyEntry {
    /// Start of the host buffer.
    pub host_address: usize,
    /// Length of the buffer in bytes.
    pub length: usize,
    /// Start of the buffer as seen from the sink.
    pub sink_address: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<ProxyEntry>,
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
}

/// Registry of host buffers visible to sink functions.
#[derive(Debug)]
pub struct ProxyTable {
    space: Arc<dyn AddressSpace>,
    slots: Mutex<Slots>,
}

impl ProxyTable {
    /// Create an empty table translating through `space`.
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            space,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Register `length` bytes at `host_address`.
    pub fn register(&self, host_address: usize, length: usize) -> DispatchResult<ProxyHandle> {
        if host_address == 0 {
            return Err(DispatchError::invalid_parameter(
                "host_address",
                "cannot register a null address",
            ));
        }
        if length == 0 {
            return Err(DispatchError::invalid_parameter(
                "length",
                "cannot register an empty buffer",
            ));
        }
        if host_address.checked_add(length).is_none() {
            return Err(DispatchError::invalid_parameter(
                "length",
                "buffer wraps around the address space",
            ));
        }

        let sink_address = self.space.map(host_address, length)?;
        let entry = ProxyEntry {
            host_address,
            length,
            sink_address,
        };

        let mut slots = self.slots.lock_recover();
        let handle = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index as usize];
                slot.entry = Some(entry);
                ProxyHandle::new(index, slot.generation)
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot {
                    generation: 1,
                    entry: Some(entry),
                });
                ProxyHandle::new(index, 1)
            }
        };

        tracing::debug!(
            %handle,
            host_address = %format!("{:#x}", host_address),
            length,
            "Registered proxy"
        );
        Ok(handle)
    }

    /// Remove a registration. The handle is stale afterwards.
    pub fn unregister(&self, handle: ProxyHandle) -> DispatchResult<ProxyEntry> {
        let entry = {
            let mut slots = self.slots.lock_recover();
            let slot = Self::live_slot(&mut slots, handle)?;
            let entry = slot.entry.take();
            slot.generation = slot.generation.wrapping_add(1).max(1);
            slots.free.push(handle.slot());
            entry
        };
        // `live_slot` only returns occupied slots.
        let entry = entry.ok_or_else(|| DispatchError::invalid_reference(handle, "not registered"))?;
        self.space.unmap(entry.sink_address, entry.length);
        tracing::debug!(%handle, "Unregistered proxy");
        Ok(entry)
    }

    /// Sink-visible start address of a registration.
    pub fn resolve(&self, handle: ProxyHandle) -> DispatchResult<u64> {
        self.entry(handle).map(|e| e.sink_address)
    }

    /// Sink-visible address `offset` bytes into a registration.
    pub fn resolve_offset(&self, handle: ProxyHandle, offset: u64) -> DispatchResult<u64> {
        let entry = self.entry(handle)?;
        if offset >= entry.length as u64 {
            return Err(DispatchError::invalid_reference(
                handle,
                format!("offset {} outside buffer of {} bytes", offset, entry.length),
            ));
        }
        Ok(entry.sink_address + offset)
    }

    /// Look up a live registration.
    pub fn entry(&self, handle: ProxyHandle) -> DispatchResult<ProxyEntry> {
        let mut slots = self.slots.lock_recover();
        let slot = Self::live_slot(&mut slots, handle)?;
        slot.entry
            .ok_or_else(|| DispatchError::invalid_reference(handle, "not registered"))
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock_recover();
        slots.entries.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Whether there are no live registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration, making all outstanding handles stale.
    ///
    /// Returns the number of registrations removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<ProxyEntry> = {
            let mut slots = self.slots.lock_recover();
            let Slots { entries, free } = &mut *slots;
            let mut removed = Vec::new();
            for (index, slot) in entries.iter_mut().enumerate() {
                if let Some(entry) = slot.entry.take() {
                    slot.generation = slot.generation.wrapping_add(1).max(1);
                    free.push(index as u32);
                    removed.push(entry);
                }
            }
            removed
        };
        for entry in &removed {
            self.space.unmap(entry.sink_address, entry.length);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Cleared proxy registrations");
        }
        removed.len()
    }

    fn live_slot(slots: &mut Slots, handle: ProxyHandle) -> DispatchResult<&mut Slot> {
        let slot = slots
            .entries
            .get_mut(handle.slot() as usize)
            .ok_or_else(|| DispatchError::invalid_reference(handle, "unknown handle"))?;
        if slot.generation != handle.generation() || slot.entry.is_none() {
            return Err(DispatchError::invalid_reference(handle, "stale handle"));
        }
        Ok(slot)
    }
}

/// A zero-initialized host buffer registered for the lifetime of the value.
///
/// The registration is removed when the buffer is dropped. While an
/// invocation referencing the buffer is in flight the sink may write to it;
/// wait for the invocation's completion before reading.
pub struct ProxiedBuffer {
    data: Box<[u8]>,
    handle: ProxyHandle,
    table: Arc<ProxyTable>,
}

impl ProxiedBuffer {
    /// Allocate `length` bytes and register them with `table`.
    pub fn new(table: Arc<ProxyTable>, length: usize) -> DispatchResult<Self> {
        let mut data = vec![0u8; length].into_boxed_slice();
        let handle = table.register(data.as_mut_ptr() as usize, length)?;
        Ok(Self {
            data,
            handle,
            table,
        })
    }

    /// Registration handle.
    pub fn handle(&self) -> ProxyHandle {
        self.handle
    }

    /// Argument referencing the start of the buffer.
    pub fn arg(&self) -> ArgValue {
        ArgValue::proxy(self.handle)
    }

    /// Argument referencing a byte offset inside the buffer.
    pub fn arg_at(&self, offset: u64) -> ArgValue {
        ArgValue::proxy_at(self.handle, offset)
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read access to the contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for ProxiedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxiedBuffer")
            .field("handle", &self.handle)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for ProxiedBuffer {
    fn drop(&mut self) {
        // The table may already have been cleared by finalization.
        if let Err(e) = self.table.unregister(self.handle) {
            tracing::debug!(error = %e, "Proxy already gone when buffer dropped");
        }
    }
}
