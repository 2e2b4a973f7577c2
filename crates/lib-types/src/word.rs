//! Word-sized argument values.
//!
//! Every argument crosses the domain boundary as a 64-bit word. The host
//! packs typed values into words bit-for-bit and the sink reinterprets the
//! bits back; which type a slot holds is a convention between the caller and
//! the sink function, not something the word itself records.

use crate::ids::ProxyHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single 64-bit argument slot.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Word(pub u64);

impl Word {
    /// The all-zero word used for unused slots.
    pub const ZERO: Word = Word(0);

    /// Raw bits.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reinterpret as a two's complement signed integer.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Reinterpret as a double.
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Reinterpret the low 32 bits as a float.
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    /// Any non-zero word is true.
    pub fn as_bool(self) -> bool {
        self.0 != 0
    }

    /// Reinterpret as an address in the receiving domain.
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({:#018x})", self.0)
    }
}

impl From<u64> for Word {
    fn from(v: u64) -> Self {
        Word(v)
    }
}

impl From<i64> for Word {
    fn from(v: i64) -> Self {
        Word(v as u64)
    }
}

impl From<u32> for Word {
    fn from(v: u32) -> Self {
        Word(u64::from(v))
    }
}

impl From<i32> for Word {
    fn from(v: i32) -> Self {
        Word(i64::from(v) as u64)
    }
}

impl From<f64> for Word {
    fn from(v: f64) -> Self {
        Word(v.to_bits())
    }
}

impl From<f32> for Word {
    fn from(v: f32) -> Self {
        Word(u64::from(v.to_bits()))
    }
}

impl From<bool> for Word {
    fn from(v: bool) -> Self {
        Word(u64::from(v))
    }
}

impl From<Word> for u64 {
    fn from(w: Word) -> Self {
        w.0
    }
}

/// A logically typed argument before marshaling.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    /// Unsigned integer.
    Unsigned(u64),

    /// Signed integer (sign-extended into the word).
    Signed(i64),

    /// Double precision float (bit pattern preserved).
    Float(f64),

    /// Single precision float (stored in the low 32 bits).
    Float32(f32),

    /// Boolean (0 or 1).
    Boolean(bool),

    /// An address already meaningful in the sink domain.
    SinkAddress(u64),

    /// A registered host buffer, translated at marshal time.
    Proxy {
        handle: ProxyHandle,
        offset: u64,
    },
}

impl ArgValue {
    /// Reference the start of a registered buffer.
    pub fn proxy(handle: ProxyHandle) -> Self {
        Self::Proxy { handle, offset: 0 }
    }

    /// Reference a byte offset inside a registered buffer.
    pub fn proxy_at(handle: ProxyHandle, offset: u64) -> Self {
        Self::Proxy { handle, offset }
    }

    /// Pack into a word, if the value needs no translation.
    ///
    /// Proxy references return `None`; they are resolved by the marshaler.
    pub fn to_word(&self) -> Option<Word> {
        match *self {
            Self::Unsigned(v) => Some(Word::from(v)),
            Self::Signed(v) => Some(Word::from(v)),
            Self::Float(v) => Some(Word::from(v)),
            Self::Float32(v) => Some(Word::from(v)),
            Self::Boolean(v) => Some(Word::from(v)),
            Self::SinkAddress(v) => Some(Word(v)),
            Self::Proxy { .. } => None,
        }
    }

    /// Short type tag used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsigned(_) => "u64",
            Self::Signed(_) => "i64",
            Self::Float(_) => "f64",
            Self::Float32(_) => "f32",
            Self::Boolean(_) => "bool",
            Self::SinkAddress(_) => "addr",
            Self::Proxy { .. } => "proxy",
        }
    }
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        Self::Unsigned(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Signed(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        Self::Signed(i64::from(v))
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<ProxyHandle> for ArgValue {
    fn from(handle: ProxyHandle) -> Self {
        Self::proxy(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_bits_preserved() {
        for v in [0u64, 1, 42, u64::MAX, 1 << 63] {
            assert_eq!(Word::from(v).as_u64(), v);
        }
        for v in [0i64, -1, i64::MIN, i64::MAX, -123_456] {
            assert_eq!(Word::from(v).as_i64(), v);
        }
        assert_eq!(Word::from(-7i32).as_i64(), -7);
    }

    #[test]
    fn test_float_bits_preserved() {
        for v in [0.0f64, -0.0, 6.0, f64::MIN_POSITIVE, f64::MAX, f64::INFINITY, 1.0 / 3.0] {
            assert_eq!(Word::from(v).as_f64().to_bits(), v.to_bits());
        }
        let nan = f64::from_bits(0x7ff8_0000_dead_beef);
        assert_eq!(Word::from(nan).as_f64().to_bits(), nan.to_bits());

        let single = 2.5f32;
        assert_eq!(Word::from(single).as_f32().to_bits(), single.to_bits());
        assert_eq!(Word::from(single).as_u64() >> 32, 0);
    }

    #[test]
    fn test_arg_value_to_word() {
        assert_eq!(ArgValue::from(true).to_word(), Some(Word(1)));
        assert_eq!(ArgValue::from(-1i64).to_word(), Some(Word(u64::MAX)));
        assert_eq!(ArgValue::SinkAddress(0x1000).to_word(), Some(Word(0x1000)));

        let handle = ProxyHandle::new(3, 1);
        assert_eq!(ArgValue::from(handle).to_word(), None);
        assert_eq!(ArgValue::from(handle).kind(), "proxy");
    }
}
