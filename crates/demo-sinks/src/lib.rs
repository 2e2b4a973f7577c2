//! # demo-sinks
//!
//! A shared library of sink functions. Point a device's `libraries` list at
//! the built `cdylib` and these functions resolve by name:
//!
//! ```toml
//! [[devices]]
//! name = "host"
//! streams = 1
//! libraries = ["target/debug/libdemo_sinks.so"]
//! ```
//!
//! Each function is exported unmangled with the sink calling convention.

use lib_dispatch::sink_fn;

sink_fn! {
    /// Mean of two unsigned integers, as an `f64`.
    #[no_mangle]
    pub fn average(args, ret) {
        let a = args.get(0).as_u64() as f64;
        let b = args.get(1).as_u64() as f64;
        let _ = ret.put_f64((a + b) / 2.0);
    }
}

sink_fn! {
    /// Sum of all nineteen argument words.
    #[no_mangle]
    pub fn sum_words(args, ret) {
        let total = args.as_array().iter().fold(0u64, |acc, w| acc.wrapping_add(*w));
        let _ = ret.put_u64(total);
    }
}

sink_fn! {
    /// Writes its first two arguments back as two `u64`s (16 bytes).
    #[no_mangle]
    pub fn echo_pair(args, ret) {
        let _ = ret.put_u64(args.get(0).as_u64());
        let _ = ret.put_u64(args.get(1).as_u64());
    }
}

sink_fn! {
    /// Fills `len` bytes at a sink address with a byte value.
    ///
    /// Arguments: address, length, value.
    #[no_mangle]
    pub fn fill_bytes(args, ret) {
        let dst: *mut u8 = args.get(0).as_ptr();
        let len = args.get(1).as_u64() as usize;
        let value = args.get(2).as_u64() as u8;
        if !dst.is_null() {
            unsafe { std::ptr::write_bytes(dst, value, len) };
        }
    }
}

sink_fn! {
    /// Always panics.
    #[no_mangle]
    pub fn explode(args, ret) {
        panic!("demo sink exploded");
    }
}
