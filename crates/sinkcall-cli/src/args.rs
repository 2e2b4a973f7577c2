//! Parsing typed arguments and result layouts from the command line.
//!
//! Arguments are written `type:value` (`u64:4`, `f64:2.5`, `bool:true`,
//! `addr:0x1000`). A bare value is taken as `u64`, `i64` when negative, or
//! `f64` when it contains a decimal point or exponent.

use anyhow::{Context, Result};
use lib_dispatch::ResultBlob;
use lib_types::ArgValue;
use serde::Serialize;
use std::str::FromStr;

/// Parse one command-line argument.
pub fn parse_arg(text: &str) -> Result<ArgValue> {
    let text = text.trim();
    let Some((kind, value)) = text.split_once(':') else {
        return parse_bare(text);
    };

    let parsed = match kind {
        "u64" | "u" => ArgValue::Unsigned(parse_unsigned(value)?),
        "i64" | "i" => ArgValue::Signed(value.parse().with_context(|| format!("Invalid i64: {}", value))?),
        "f64" | "f" => ArgValue::Float(value.parse().with_context(|| format!("Invalid f64: {}", value))?),
        "f32" => ArgValue::Float32(value.parse().with_context(|| format!("Invalid f32: {}", value))?),
        "bool" => ArgValue::Boolean(value.parse().with_context(|| format!("Invalid bool: {}", value))?),
        "addr" => ArgValue::SinkAddress(parse_unsigned(value)?),
        other => anyhow::bail!("Unknown argument type '{}' in '{}'", other, text),
    };
    Ok(parsed)
}

fn parse_bare(text: &str) -> Result<ArgValue> {
    if text.contains(['.', 'e', 'E']) && !text.starts_with("0x") {
        return Ok(ArgValue::Float(
            text.parse().with_context(|| format!("Invalid number: {}", text))?,
        ));
    }
    if text.starts_with('-') {
        return Ok(ArgValue::Signed(
            text.parse().with_context(|| format!("Invalid number: {}", text))?,
        ));
    }
    Ok(ArgValue::Unsigned(parse_unsigned(text)?))
}

fn parse_unsigned(text: &str) -> Result<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).with_context(|| format!("Invalid hex value: {}", text)),
        None => text.parse().with_context(|| format!("Invalid unsigned value: {}", text)),
    }
}

/// Type of a field read back from a result blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U64,
    I64,
    F64,
    U32,
}

impl FieldKind {
    pub fn size(self) -> usize {
        match self {
            Self::U64 | Self::I64 | Self::F64 => 8,
            Self::U32 => 4,
        }
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "u64" => Ok(Self::U64),
            "i64" => Ok(Self::I64),
            "f64" => Ok(Self::F64),
            "u32" => Ok(Self::U32),
            other => anyhow::bail!("Unknown result field type '{}'", other),
        }
    }
}

/// A decoded result field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Decoded {
    U64(u64),
    I64(i64),
    F64(f64),
    U32(u32),
}

impl std::fmt::Display for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::U64(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
        }
    }
}

/// Total bytes needed by a field layout.
pub fn layout_size(layout: &[FieldKind]) -> usize {
    layout.iter().map(|k| k.size()).sum()
}

/// Read consecutive fields from a blob.
pub fn decode(blob: &ResultBlob, layout: &[FieldKind]) -> Result<Vec<Decoded>> {
    let mut offset = 0;
    let mut fields = Vec::with_capacity(layout.len());
    for kind in layout {
        let field = match kind {
            FieldKind::U64 => blob.read_u64(offset).map(Decoded::U64),
            FieldKind::I64 => blob.read_i64(offset).map(Decoded::I64),
            FieldKind::F64 => blob.read_f64(offset).map(Decoded::F64),
            FieldKind::U32 => blob.read_u32(offset).map(Decoded::U32),
        };
        let field = field.with_context(|| {
            format!("Result blob of {} bytes has no {:?} at offset {}", blob.capacity(), kind, offset)
        })?;
        fields.push(field);
        offset += kind.size();
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_arguments() {
        assert_eq!(parse_arg("u64:4").unwrap(), ArgValue::Unsigned(4));
        assert_eq!(parse_arg("i64:-3").unwrap(), ArgValue::Signed(-3));
        assert_eq!(parse_arg("f64:2.5").unwrap(), ArgValue::Float(2.5));
        assert_eq!(parse_arg("f32:0.5").unwrap(), ArgValue::Float32(0.5));
        assert_eq!(parse_arg("bool:true").unwrap(), ArgValue::Boolean(true));
        assert_eq!(parse_arg("addr:0x1000").unwrap(), ArgValue::SinkAddress(0x1000));
        assert!(parse_arg("str:hello").is_err());
        assert!(parse_arg("u64:-1").is_err());
    }

    #[test]
    fn test_bare_arguments() {
        assert_eq!(parse_arg("8").unwrap(), ArgValue::Unsigned(8));
        assert_eq!(parse_arg("-8").unwrap(), ArgValue::Signed(-8));
        assert_eq!(parse_arg("1.25").unwrap(), ArgValue::Float(1.25));
        assert_eq!(parse_arg("0xff").unwrap(), ArgValue::Unsigned(255));
        assert!(parse_arg("eight").is_err());
    }

    #[test]
    fn test_decode_layout() {
        let layout: Vec<FieldKind> = ["f64", "u32"].iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(layout_size(&layout), 12);

        let blob = ResultBlob::with_capacity(12);
        let fields = decode(&blob, &layout).unwrap();
        assert_eq!(fields, vec![Decoded::F64(0.0), Decoded::U32(0)]);

        let short = ResultBlob::with_capacity(8);
        assert!(decode(&short, &layout).is_err());
    }
}
