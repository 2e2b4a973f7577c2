//! Result blob channel.
//!
//! A caller that wants data back from a sink function passes a
//! [`ResultBlob`] with a declared capacity. The sink writes into a staging
//! area of exactly that capacity, followed by a guard region and a status
//! record; after the sink returns, the staging area is checked and copied
//! into the caller's blob.
//!
//! A result that did not fit is never silently truncated. It surfaces as
//! [`DispatchError::Capacity`], either because the sink recorded the size it
//! needed or because it wrote into the guard region.

use crate::error::{DispatchError, DispatchResult};
use crate::sink::SinkReport;
use lib_types::{RESULT_GUARD_BYTE, RESULT_GUARD_SIZE, SINK_STATUS_SIZE};
use std::ffi::c_void;

/// Caller-owned buffer receiving a sink function's result.
#[derive(Clone, PartialEq, Eq)]
pub struct ResultBlob {
    data: Vec<u8>,
}

impl ResultBlob {
    /// A zeroed blob with the given capacity.
    pub fn with_capacity(capacity: u16) -> Self {
        Self {
            data: vec![0; usize::from(capacity)],
        }
    }

    /// Declared capacity in bytes.
    pub fn capacity(&self) -> u16 {
        // `data` is only ever sized from a `u16`.
        self.data.len() as u16
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Read a native-endian `f64` at a byte offset.
    pub fn read_f64(&self, offset: usize) -> Option<f64> {
        self.read_array::<8>(offset).map(f64::from_ne_bytes)
    }

    /// Read a native-endian `u64` at a byte offset.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        self.read_array::<8>(offset).map(u64::from_ne_bytes)
    }

    /// Read a native-endian `i64` at a byte offset.
    pub fn read_i64(&self, offset: usize) -> Option<i64> {
        self.read_array::<8>(offset).map(i64::from_ne_bytes)
    }

    /// Read a native-endian `u32` at a byte offset.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.read_array::<4>(offset).map(u32::from_ne_bytes)
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.data.get(offset..end)?.try_into().ok()
    }
}

impl std::fmt::Debug for ResultBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultBlob")
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Staging area handed to the sink: `capacity` result bytes, a guard region
/// and the sink's status record.
pub(crate) struct StagingArea {
    buf: Vec<u8>,
    capacity: u16,
}

impl StagingArea {
    pub(crate) fn new(capacity: u16) -> Self {
        let guard_start = usize::from(capacity);
        let mut buf = vec![0u8; guard_start + RESULT_GUARD_SIZE + SINK_STATUS_SIZE];
        buf[guard_start..guard_start + RESULT_GUARD_SIZE].fill(RESULT_GUARD_BYTE);
        Self { buf, capacity }
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.capacity
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.buf.as_mut_ptr().cast()
    }

    /// The result bytes, without guard or status.
    pub(crate) fn result(&self) -> &[u8] {
        &self.buf[..usize::from(self.capacity)]
    }

    /// What the sink recorded in the status record.
    pub(crate) fn report(&self) -> SinkReport {
        SinkReport::decode(&self.buf[usize::from(self.capacity) + RESULT_GUARD_SIZE..])
    }

    /// Index of the last guard byte that no longer holds the guard pattern.
    fn overrun_extent(&self) -> Option<usize> {
        let start = usize::from(self.capacity);
        self.buf[start..start + RESULT_GUARD_SIZE]
            .iter()
            .rposition(|&b| b != RESULT_GUARD_BYTE)
            .map(|i| start + i)
    }
}

/// Check what the sink did with the staging area and hand the result back.
pub(crate) fn settle(
    staging: StagingArea,
    blob: Option<ResultBlob>,
) -> DispatchResult<Option<ResultBlob>> {
    let capacity = staging.capacity();
    let reported = staging.report().oversize;

    if let Some(index) = staging.overrun_extent() {
        tracing::error!(
            capacity,
            overrun_index = index,
            "Sink wrote past the result capacity"
        );
        return Err(DispatchError::Capacity {
            capacity,
            required: Some(reported.unwrap_or(0).max(index + 1)),
        });
    }

    if let Some(required) = reported {
        tracing::warn!(capacity, required, "Result blob too small");
        return Err(DispatchError::Capacity {
            capacity,
            required: Some(required),
        });
    }

    Ok(blob.map(|mut blob| {
        blob.data.copy_from_slice(staging.result());
        blob
    }))
}
