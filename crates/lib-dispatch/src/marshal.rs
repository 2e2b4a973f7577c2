//! Argument marshaling.
//!
//! Converts a logical argument list into the fixed-arity word array every
//! sink function receives. Unused slots are zero. Proxy references are
//! translated to sink-visible addresses here, so a stale handle fails the
//! call before anything is queued.

use crate::error::{DispatchError, DispatchResult};
use crate::proxy::ProxyTable;
use lib_types::{ArgValue, Word, MAX_ARGS};

/// An ordered list of logical arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgList {
    values: Vec<ArgValue>,
}

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument (builder style).
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.values.push(value.into());
        self
    }

    /// Append an argument in place.
    pub fn push(&mut self, value: impl Into<ArgValue>) -> &mut Self {
        self.values.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }
}

impl From<Vec<ArgValue>> for ArgList {
    fn from(values: Vec<ArgValue>) -> Self {
        Self { values }
    }
}

impl FromIterator<ArgValue> for ArgList {
    fn from_iter<I: IntoIterator<Item = ArgValue>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A call ready for the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarshaledCall {
    words: [Word; MAX_ARGS],
    count: usize,
    result_capacity: u16,
}

impl MarshaledCall {
    /// All argument slots, including zero-filled ones.
    pub fn words(&self) -> &[Word; MAX_ARGS] {
        &self.words
    }

    /// Slots actually supplied by the caller.
    pub fn used(&self) -> &[Word] {
        &self.words[..self.count]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Declared result capacity in bytes (0 when no result is expected).
    pub fn result_capacity(&self) -> u16 {
        self.result_capacity
    }

    /// Raw words in calling order.
    pub fn raw(&self) -> [u64; MAX_ARGS] {
        self.words.map(Word::as_u64)
    }
}

/// Packs argument lists against a proxy table and a result size limit.
#[derive(Clone, Copy, Debug)]
pub struct Marshaler<'a> {
    proxies: &'a ProxyTable,
    max_result_size: u16,
}

impl<'a> Marshaler<'a> {
    pub fn new(proxies: &'a ProxyTable, max_result_size: u16) -> Self {
        Self {
            proxies,
            max_result_size,
        }
    }

    /// Marshal `args` for a call expecting `result_capacity` bytes back.
    ///
    /// Fails with an arity error for more than [`MAX_ARGS`] arguments,
    /// an invalid parameter error when the capacity exceeds the configured
    /// limit, and an invalid reference error for stale proxies.
    pub fn marshal(&self, args: &ArgList, result_capacity: u16) -> DispatchResult<MarshaledCall> {
        if args.len() > MAX_ARGS {
            return Err(DispatchError::Arity {
                given: args.len(),
                max: MAX_ARGS,
            });
        }
        if result_capacity > self.max_result_size {
            return Err(DispatchError::invalid_parameter(
                "result_capacity",
                format!(
                    "{} bytes exceeds the limit of {} bytes",
                    result_capacity, self.max_result_size
                ),
            ));
        }

        let mut words = [Word::ZERO; MAX_ARGS];
        for (slot, value) in words.iter_mut().zip(args.values()) {
            *slot = match *value {
                ArgValue::Unsigned(v) => Word::from(v),
                ArgValue::Signed(v) => Word::from(v),
                ArgValue::Float(v) => Word::from(v),
                ArgValue::Float32(v) => Word::from(v),
                ArgValue::Boolean(v) => Word::from(v),
                ArgValue::SinkAddress(address) => Word(address),
                ArgValue::Proxy { handle, offset } => {
                    Word(self.proxies.resolve_offset(handle, offset)?)
                }
            };
        }

        Ok(MarshaledCall {
            words,
            count: args.len(),
            result_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::SharedAddressSpace;
    use lib_types::{ProxyHandle, RETURN_SIZE_LIMIT};
    use std::sync::Arc;

    fn table() -> ProxyTable {
        ProxyTable::new(Arc::new(SharedAddressSpace))
    }

    #[test]
    fn test_scalars_pack_bit_exact() {
        let proxies = table();
        let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);
        let args = ArgList::new()
            .arg(4u64)
            .arg(-1i64)
            .arg(2.5f64)
            .arg(true)
            .arg(-0.75f32)
            .arg(ArgValue::SinkAddress(0xdead_0000));
        let call = marshaler.marshal(&args, 8).unwrap();

        assert_eq!(call.count(), 6);
        assert_eq!(call.words()[0].as_u64(), 4);
        assert_eq!(call.words()[1].as_i64(), -1);
        assert_eq!(call.words()[2].as_f64(), 2.5);
        assert!(call.words()[3].as_bool());
        assert_eq!(call.words()[4].as_f32(), -0.75);
        assert_eq!(call.words()[4].as_u64() >> 32, 0);
        assert_eq!(call.words()[5].as_u64(), 0xdead_0000);
        assert!(call.words()[6..].iter().all(|w| *w == Word::ZERO));
        assert_eq!(call.result_capacity(), 8);
    }

    #[test]
    fn test_max_arguments_accepted() {
        let proxies = table();
        let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);
        let args: ArgList = (0..MAX_ARGS as u64).map(ArgValue::Unsigned).collect();
        let call = marshaler.marshal(&args, 0).unwrap();
        assert_eq!(call.raw()[18], 18);
        assert_eq!(call.used().len(), MAX_ARGS);
    }

    #[test]
    fn test_too_many_arguments() {
        let proxies = table();
        let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);
        let args: ArgList = (0..20u64).map(ArgValue::Unsigned).collect();
        let err = marshaler.marshal(&args, 0).unwrap_err();
        assert!(matches!(err, DispatchError::Arity { given: 20, max: 19 }));
    }

    #[test]
    fn test_capacity_over_limit() {
        let proxies = table();
        let marshaler = Marshaler::new(&proxies, 16);
        assert!(marshaler.marshal(&ArgList::new(), 16).is_ok());
        assert!(matches!(
            marshaler.marshal(&ArgList::new(), 17),
            Err(DispatchError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_proxy_translation() {
        let proxies = table();
        let handle = proxies.register(0x4000, 32).unwrap();
        let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);

        let args = ArgList::new()
            .arg(handle)
            .arg(ArgValue::proxy_at(handle, 16));
        let call = marshaler.marshal(&args, 0).unwrap();
        assert_eq!(call.words()[0].as_u64(), 0x4000);
        assert_eq!(call.words()[1].as_u64(), 0x4010);
    }

    #[test]
    fn test_stale_proxy_rejected() {
        let proxies = table();
        let handle = proxies.register(0x4000, 32).unwrap();
        proxies.unregister(handle).unwrap();
        let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);

        let err = marshaler.marshal(&ArgList::new().arg(handle), 0).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidReference { .. }));

        let never = ProxyHandle::new(7, 3);
        assert!(marshaler.marshal(&ArgList::new().arg(never), 0).is_err());
    }
}
