//! Protocol limits shared by the host and sink sides.

/// Maximum number of argument words a sink function receives.
///
/// Sink thunks always take exactly this many `u64` parameters, followed by
/// the result buffer address and its capacity. Callers passing fewer
/// arguments get the remaining slots zero-filled.
pub const MAX_ARGS: usize = 19;

/// Default upper bound on the declared result blob capacity, in bytes.
pub const RETURN_SIZE_LIMIT: u16 = 64;

/// Maximum size of a sink function name, including the terminating NUL.
pub const MAX_FUNC_NAME_SIZE: usize = 80;

/// Number of guard bytes placed after the result staging area.
pub const RESULT_GUARD_SIZE: usize = 64;

/// Byte pattern written into the guard area.
pub const RESULT_GUARD_BYTE: u8 = 0xA5;

/// Size of the status record placed after the guard area.
///
/// The sink writes the result size it needed and any panic message here;
/// the host reads it back once the call returns.
pub const SINK_STATUS_SIZE: usize = 128;
