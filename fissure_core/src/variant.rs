use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariantError {
    #[error("cannot convert {from} value to {to}")]
    Conversion {
        from: &'static str,
        to: &'static str,
    },
    #[error("string '{0}' is not a number")]
    NotANumber(String),
}

/// A value held by a data element.
///
/// One variant per kind of value a format can describe. Conversions between
/// variants are explicit and only happen at the edges (generation, publishers,
/// relation lookups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Bytes(Vec<u8>),
    Str(String),
    /// A bit string whose length is not a multiple of eight.
    Bits { data: Vec<u8>, len: u64 },
}

impl Variant {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Variant::Bool(_) => "bool",
            Variant::Int(_) => "int",
            Variant::UInt(_) => "uint",
            Variant::Bytes(_) => "bytes",
            Variant::Str(_) => "string",
            Variant::Bits { .. } => "bits",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Variant::Bool(_) | Variant::Int(_) | Variant::UInt(_))
    }

    /// Interprets the value as an unsigned integer. Negative integers keep their
    /// two's complement bit pattern.
    pub fn as_u64(&self) -> Result<u64, VariantError> {
        match self {
            Variant::Bool(b) => Ok(*b as u64),
            Variant::Int(v) => Ok(*v as u64),
            Variant::UInt(v) => Ok(*v),
            Variant::Str(s) => parse_number(s).map(|v| v as u64),
            other => Err(VariantError::Conversion {
                from: other.kind_name(),
                to: "uint",
            }),
        }
    }

    pub fn as_i64(&self) -> Result<i64, VariantError> {
        match self {
            Variant::Bool(b) => Ok(*b as i64),
            Variant::Int(v) => Ok(*v),
            Variant::UInt(v) => Ok(*v as i64),
            Variant::Str(s) => parse_number(s),
            other => Err(VariantError::Conversion {
                from: other.kind_name(),
                to: "int",
            }),
        }
    }

    /// Raw bytes of a byte-like value.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VariantError> {
        match self {
            Variant::Bytes(b) => Ok(b.clone()),
            Variant::Str(s) => Ok(s.as_bytes().to_vec()),
            Variant::Bits { data, .. } => Ok(data.clone()),
            other => Err(VariantError::Conversion {
                from: other.kind_name(),
                to: "bytes",
            }),
        }
    }

    /// Length in bits of a byte-like value.
    pub fn bit_len(&self) -> Option<u64> {
        match self {
            Variant::Bytes(b) => Some(b.len() as u64 * 8),
            Variant::Str(s) => Some(s.len() as u64 * 8),
            Variant::Bits { len, .. } => Some(*len),
            _ => None,
        }
    }

    /// Compares two values loosely: numbers by their bit pattern, byte-like
    /// values by content.
    pub fn loosely_equals(&self, other: &Variant) -> bool {
        if self.is_numeric() || other.is_numeric() {
            return match (self.as_u64(), other.as_u64()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
        }
        match (self.to_bytes(), other.to_bytes()) {
            (Ok(a), Ok(b)) => a == b && self.bit_len() == other.bit_len(),
            _ => false,
        }
    }
}

fn parse_number(s: &str) -> Result<i64, VariantError> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse::<i64>().ok()
    };
    parsed.ok_or_else(|| VariantError::NotANumber(s.to_string()))
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Bool(b) => write!(f, "{b}"),
            Variant::Int(v) => write!(f, "{v}"),
            Variant::UInt(v) => write!(f, "{v}"),
            Variant::Str(s) => write!(f, "{s:?}"),
            Variant::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Variant::Bits { data, len } => {
                for byte in data {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, " ({len} bits)")
            }
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Variant::UInt(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Bytes(v)
    }
}

impl From<&[u8]> for Variant {
    fn from(v: &[u8]) -> Self {
        Variant::Bytes(v.to_vec())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::Str(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        assert_eq!(Variant::Int(-1).as_u64(), Ok(u64::MAX));
        assert_eq!(Variant::UInt(7).as_i64(), Ok(7));
        assert_eq!(Variant::Str("0x10".into()).as_u64(), Ok(16));
        assert_eq!(Variant::Bool(true).as_u64(), Ok(1));
        assert!(Variant::Bytes(vec![1]).as_u64().is_err());
        assert!(matches!(
            Variant::Str("nope".into()).as_i64(),
            Err(VariantError::NotANumber(_))
        ));
    }

    #[test]
    fn byte_conversions() {
        assert_eq!(Variant::Str("GET".into()).to_bytes().unwrap(), b"GET".to_vec());
        assert_eq!(Variant::Str("GET".into()).bit_len(), Some(24));
        assert!(Variant::UInt(3).to_bytes().is_err());
    }

    #[test]
    fn loose_equality_compares_numbers_and_bytes() {
        assert!(Variant::Int(1).loosely_equals(&Variant::UInt(1)));
        assert!(!Variant::Int(1).loosely_equals(&Variant::UInt(2)));
        assert!(Variant::Str("ab".into()).loosely_equals(&Variant::Bytes(b"ab".to_vec())));
        assert!(!Variant::Str("ab".into()).loosely_equals(&Variant::UInt(0)));
    }
}
