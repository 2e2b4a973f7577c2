//! The sink-side calling convention.
//!
//! Every sink function has the same shape: nineteen 64-bit argument words,
//! the address of the result staging area and its capacity.
//!
//! ```c
//! void sink_fn(uint64_t a0, ..., uint64_t a18, void *ret, uint16_t ret_size);
//! ```
//!
//! Sink code written in Rust should use [`sink_fn!`](crate::sink_fn), which
//! expands to a function of that shape, hands the body a [`SinkArgs`] view
//! and a [`ResultSlot`], and keeps panics from unwinding across the
//! boundary.

use lib_types::{Word, MAX_ARGS, RESULT_GUARD_SIZE, SINK_STATUS_SIZE};
use std::ffi::c_void;

/// Function signature of a sink function.
pub type SinkThunk = unsafe extern "C" fn(
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
    a7: u64,
    a8: u64,
    a9: u64,
    a10: u64,
    a11: u64,
    a12: u64,
    a13: u64,
    a14: u64,
    a15: u64,
    a16: u64,
    a17: u64,
    a18: u64,
    ret: *mut c_void,
    ret_size: u16,
);

/// Call a sink thunk with a full argument array.
///
/// # Safety
///
/// `thunk` must follow the sink calling convention and `ret` must be valid
/// for writes of `ret_size` bytes (or null with `ret_size == 0`).
pub unsafe fn call_thunk(
    thunk: SinkThunk,
    w: &[u64; MAX_ARGS],
    ret: *mut c_void,
    ret_size: u16,
) {
    thunk(
        w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8], w[9], w[10], w[11], w[12], w[13],
        w[14], w[15], w[16], w[17], w[18], ret, ret_size,
    )
}

/// Argument words as received by a sink function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkArgs([u64; MAX_ARGS]);

impl SinkArgs {
    pub fn new(words: [u64; MAX_ARGS]) -> Self {
        Self(words)
    }

    /// Word at `index`. Slots past the caller's argument count are zero.
    pub fn get(&self, index: usize) -> Word {
        self.0.get(index).copied().map(Word).unwrap_or(Word::ZERO)
    }

    pub fn as_array(&self) -> &[u64; MAX_ARGS] {
        &self.0
    }
}

/// Writer over the result staging area handed to a sink function.
///
/// Writes are sequential. A write that does not fit is truncated to the
/// remaining capacity and the total size the sink needed is recorded in the
/// call's status record, which fails the invocation with a capacity error.
pub struct ResultSlot<'a> {
    buf: &'a mut [u8],
    written: usize,
    status: Option<SinkStatus>,
}

impl<'a> ResultSlot<'a> {
    /// Wrap the raw result pointer passed to a sink function.
    ///
    /// # Safety
    ///
    /// `ret` must be null or point at a host staging area: `ret_size` result
    /// bytes, the guard region and the status record, all valid for writes
    /// for `'a`.
    pub unsafe fn from_raw(ret: *mut c_void, ret_size: u16) -> Self {
        let buf: &'a mut [u8] = if ret.is_null() || ret_size == 0 {
            &mut []
        } else {
            std::slice::from_raw_parts_mut(ret.cast::<u8>(), usize::from(ret_size))
        };
        Self {
            buf,
            written: 0,
            status: SinkStatus::locate(ret, ret_size),
        }
    }

    /// Declared capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append raw bytes.
    ///
    /// Returns the total size required when the bytes did not fit.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), usize> {
        let required = self.written + bytes.len();
        let fits = (self.buf.len() - self.written).min(bytes.len());
        self.buf[self.written..self.written + fits].copy_from_slice(&bytes[..fits]);
        self.written += fits;
        if required > self.buf.len() {
            self.report_required(required);
            return Err(required);
        }
        Ok(())
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), usize> {
        self.put(&value.to_ne_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), usize> {
        self.put(&value.to_ne_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<(), usize> {
        self.put(&value.to_ne_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), usize> {
        self.put(&value.to_ne_bytes())
    }

    /// Tell the host that the result needed `required` bytes.
    ///
    /// For sinks that size their result before writing it.
    pub fn report_required(&mut self, required: usize) {
        if let Some(status) = self.status {
            status.record_required(required);
        }
    }
}

// Status record layout, from the end of the guard region.
const STATUS_REQUIRED: usize = 0;
const STATUS_PANICKED: usize = 8;
const STATUS_MESSAGE_LEN: usize = 10;
const STATUS_MESSAGE: usize = 12;
const MESSAGE_LIMIT: usize = SINK_STATUS_SIZE - STATUS_MESSAGE;

/// Writer for the status record that follows a staging area's guard region.
///
/// The record travels with the call itself, so a sink compiled into a
/// shared library reports to the host through the same memory as one
/// registered in-process.
#[doc(hidden)]
#[derive(Clone, Copy, Debug)]
pub struct SinkStatus {
    base: *mut u8,
}

impl SinkStatus {
    /// Find the status record behind a result area.
    ///
    /// # Safety
    ///
    /// `ret` must be null or point at a host staging area of `ret_size`
    /// result bytes.
    pub unsafe fn locate(ret: *mut c_void, ret_size: u16) -> Option<Self> {
        if ret.is_null() {
            return None;
        }
        let offset = usize::from(ret_size) + RESULT_GUARD_SIZE;
        Some(Self {
            base: ret.cast::<u8>().add(offset),
        })
    }

    /// Raise the recorded required size to at least `required`.
    pub fn record_required(&self, required: usize) {
        let required = required as u64;
        // SAFETY: `locate` hands out only pointers to SINK_STATUS_SIZE writable bytes.
        unsafe {
            let slot = self.base.add(STATUS_REQUIRED).cast::<[u8; 8]>();
            if required > u64::from_ne_bytes(slot.read()) {
                slot.write(required.to_ne_bytes());
            }
        }
    }

    /// Mark the call as panicked with `message`, truncated to fit.
    pub fn record_panic(&self, message: &str) {
        let mut len = message.len().min(MESSAGE_LIMIT);
        while !message.is_char_boundary(len) {
            len -= 1;
        }
        // SAFETY: `locate` hands out only pointers to SINK_STATUS_SIZE writable bytes.
        unsafe {
            self.base.add(STATUS_PANICKED).write(1);
            self.base
                .add(STATUS_MESSAGE_LEN)
                .cast::<[u8; 2]>()
                .write((len as u16).to_ne_bytes());
            std::ptr::copy_nonoverlapping(message.as_ptr(), self.base.add(STATUS_MESSAGE), len);
        }
    }
}

/// What a sink function reported about its own execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SinkReport {
    /// Largest result size the sink needed, if it exceeded the capacity.
    pub oversize: Option<usize>,
    /// Panic message, if the sink body panicked.
    pub panicked: Option<String>,
}

impl SinkReport {
    /// Decode a `SINK_STATUS_SIZE`-byte status record.
    pub(crate) fn decode(record: &[u8]) -> Self {
        let required = record
            .get(STATUS_REQUIRED..STATUS_REQUIRED + 8)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u64::from_ne_bytes);
        let panicked = record.get(STATUS_PANICKED).is_some_and(|&flag| flag != 0);
        let message = panicked.then(|| {
            let len = record
                .get(STATUS_MESSAGE_LEN..STATUS_MESSAGE)
                .and_then(|b| b.try_into().ok())
                .map_or(0, |b| usize::from(u16::from_ne_bytes(b)))
                .min(MESSAGE_LIMIT);
            let bytes = record.get(STATUS_MESSAGE..STATUS_MESSAGE + len).unwrap_or(&[]);
            String::from_utf8_lossy(bytes).into_owned()
        });
        Self {
            oversize: (required > 0).then_some(required as usize),
            panicked: message,
        }
    }
}

#[doc(hidden)]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Define a sink function.
///
/// ```ignore
/// sink_fn! {
///     #[no_mangle]
///     pub fn average(args, ret) {
///         let sum = args.get(0).as_u64() + args.get(1).as_u64();
///         let _ = ret.put_f64(sum as f64 / 2.0);
///     }
/// }
/// ```
///
/// The body sees `args` as a [`SinkArgs`] and `ret` as a [`ResultSlot`].
/// A panic in the body is caught and written to the call's status record
/// instead of unwinding into foreign frames. The same holds when the
/// function is exported from a shared library.
#[macro_export]
macro_rules! sink_fn {
    ($(#[$meta:meta])* $vis:vis fn $name:ident($args:ident, $ret:ident) $body:block) => {
        $(#[$meta])*
        #[allow(unused_mut, unused_variables, unused_unsafe, clippy::too_many_arguments)]
        $vis unsafe extern "C" fn $name(
            a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64,
            a7: u64, a8: u64, a9: u64, a10: u64, a11: u64, a12: u64, a13: u64,
            a14: u64, a15: u64, a16: u64, a17: u64, a18: u64,
            ret_ptr: *mut ::std::ffi::c_void,
            ret_size: u16,
        ) {
            let $args = $crate::sink::SinkArgs::new([
                a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16,
                a17, a18,
            ]);
            let status = unsafe { $crate::sink::SinkStatus::locate(ret_ptr, ret_size) };
            let mut $ret = unsafe { $crate::sink::ResultSlot::from_raw(ret_ptr, ret_size) };
            let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $body));
            if let (Err(payload), Some(status)) = (outcome, status) {
                status.record_panic(&$crate::sink::panic_message(payload.as_ref()));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::StagingArea;

    crate::sink_fn! {
        fn write_pair(args, ret) {
            let _ = ret.put_u64(args.get(0).as_u64());
            let _ = ret.put_u64(args.get(1).as_u64());
        }
    }

    crate::sink_fn! {
        fn explode(args, ret) {
            panic!("sink exploded");
        }
    }

    crate::sink_fn! {
        fn explode_long(args, ret) {
            panic!("{}", "\u{20ac}".repeat(100));
        }
    }

    fn run(thunk: SinkThunk, words: [u64; MAX_ARGS], capacity: u16) -> (StagingArea, SinkReport) {
        let mut staging = StagingArea::new(capacity);
        unsafe { call_thunk(thunk, &words, staging.as_mut_ptr(), staging.capacity()) };
        let report = staging.report();
        (staging, report)
    }

    #[test]
    fn test_result_slot_fits() {
        let mut words = [0u64; MAX_ARGS];
        words[0] = 7;
        words[1] = 9;
        let (staging, report) = run(write_pair, words, 16);
        assert_eq!(report, SinkReport::default());
        let bytes = staging.result();
        assert_eq!(u64::from_ne_bytes(bytes[..8].try_into().unwrap()), 7);
        assert_eq!(u64::from_ne_bytes(bytes[8..].try_into().unwrap()), 9);
    }

    #[test]
    fn test_result_slot_records_oversize() {
        let mut words = [0u64; MAX_ARGS];
        words[0] = 1;
        words[1] = u64::MAX;
        let (staging, report) = run(write_pair, words, 12);
        assert_eq!(report.oversize, Some(16));
        // Truncated write stays within the capacity.
        assert_eq!(&staging.result()[8..], &[0xFF; 4]);
    }

    #[test]
    fn test_oversize_recorded_without_result_area() {
        let (_, report) = run(write_pair, [0; MAX_ARGS], 0);
        assert_eq!(report.oversize, Some(16));
    }

    #[test]
    fn test_panic_is_recorded_not_unwound() {
        let (_, report) = run(explode, [0; MAX_ARGS], 0);
        assert_eq!(report.panicked.as_deref(), Some("sink exploded"));
        assert_eq!(report.oversize, None);
    }

    #[test]
    fn test_long_panic_message_truncated_on_char_boundary() {
        let (_, report) = run(explode_long, [0; MAX_ARGS], 8);
        let message = report.panicked.unwrap();
        assert!(message.len() <= MESSAGE_LIMIT);
        assert!(!message.is_empty());
        assert!(message.chars().all(|c| c == '\u{20ac}'));
    }

    #[test]
    fn test_null_result_area() {
        let mut slot = unsafe { ResultSlot::from_raw(std::ptr::null_mut(), 8) };
        assert_eq!(slot.capacity(), 0);
        assert_eq!(slot.put_u32(1), Err(4));
        assert_eq!(slot.written(), 0);
    }

    #[test]
    fn test_decode_clamps_message_length() {
        let mut record = [0u8; SINK_STATUS_SIZE];
        record[STATUS_PANICKED] = 1;
        record[STATUS_MESSAGE_LEN..STATUS_MESSAGE].copy_from_slice(&u16::MAX.to_ne_bytes());
        let report = SinkReport::decode(&record);
        assert_eq!(report.panicked.map(|m| m.len()), Some(MESSAGE_LIMIT));
    }

    #[test]
    fn test_sink_args_out_of_range_is_zero() {
        let args = SinkArgs::new([3; MAX_ARGS]);
        assert_eq!(args.get(18).as_u64(), 3);
        assert_eq!(args.get(19), Word::ZERO);
    }
}
