//! Column and value types seen at the index boundary

mod chunk;

pub use chunk::VectorChunk;

use serde::{Deserialize, Serialize};

/// Row identifier (unique across the table)
pub type RowId = u64;

/// Logical column types the host can hand to an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    Float,
    Double,
    Varchar,
    /// Fixed-size array column
    Array { child: Box<LogicalType>, size: usize },
}

impl LogicalType {
    pub fn array(child: LogicalType, size: usize) -> Self {
        LogicalType::Array { child: Box::new(child), size }
    }

    /// Element type and length for fixed-size arrays
    pub fn array_parts(&self) -> Option<(&LogicalType, usize)> {
        match self {
            LogicalType::Array { child, size } => Some((child.as_ref(), *size)),
            _ => None,
        }
    }
}

/// Scalar representation used for stored vector components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl Default for ScalarKind {
    fn default() -> Self {
        ScalarKind::F32
    }
}

impl ScalarKind {
    /// Map an array element type to a scalar kind; non-numeric types fall back to f32.
    pub fn from_logical(ty: &LogicalType) -> Self {
        match ty {
            LogicalType::Float => ScalarKind::F32,
            LogicalType::Double => ScalarKind::F64,
            LogicalType::TinyInt => ScalarKind::I8,
            LogicalType::SmallInt => ScalarKind::I16,
            LogicalType::Integer => ScalarKind::I32,
            LogicalType::BigInt => ScalarKind::I64,
            LogicalType::UTinyInt => ScalarKind::U8,
            LogicalType::USmallInt => ScalarKind::U16,
            LogicalType::UInteger => ScalarKind::U32,
            LogicalType::UBigInt => ScalarKind::U64,
            _ => ScalarKind::F32,
        }
    }

    /// Bring a component into the representable range of this kind
    #[inline]
    pub fn quantize(self, value: f32) -> f32 {
        let (lo, hi) = match self {
            ScalarKind::F32 | ScalarKind::F64 => return value,
            ScalarKind::I8 => (i8::MIN as f32, i8::MAX as f32),
            ScalarKind::I16 => (i16::MIN as f32, i16::MAX as f32),
            ScalarKind::I32 => (i32::MIN as f32, i32::MAX as f32),
            ScalarKind::I64 => (i64::MIN as f32, i64::MAX as f32),
            ScalarKind::U8 => (0.0, u8::MAX as f32),
            ScalarKind::U16 => (0.0, u16::MAX as f32),
            ScalarKind::U32 => (0.0, u32::MAX as f32),
            ScalarKind::U64 => (0.0, u64::MAX as f32),
        };
        value.round().clamp(lo, hi)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::U8 => "u8",
            ScalarKind::U16 => "u16",
            ScalarKind::U32 => "u32",
            ScalarKind::U64 => "u64",
        }
    }
}

/// Constraint requested for an index at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexConstraintType {
    None,
    Unique,
    Primary,
    Foreign,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_kind_mapping() {
        assert_eq!(ScalarKind::from_logical(&LogicalType::Float), ScalarKind::F32);
        assert_eq!(ScalarKind::from_logical(&LogicalType::Double), ScalarKind::F64);
        assert_eq!(ScalarKind::from_logical(&LogicalType::UTinyInt), ScalarKind::U8);
        assert_eq!(ScalarKind::from_logical(&LogicalType::Varchar), ScalarKind::F32);
    }

    #[test]
    fn test_quantize_integer_kinds() {
        assert_eq!(ScalarKind::I8.quantize(300.0), 127.0);
        assert_eq!(ScalarKind::U8.quantize(-4.0), 0.0);
        assert_eq!(ScalarKind::I16.quantize(2.6), 3.0);
        assert_eq!(ScalarKind::F32.quantize(2.6), 2.6);
    }

    #[test]
    fn test_array_parts() {
        let ty = LogicalType::array(LogicalType::Float, 3);
        let (child, size) = ty.array_parts().unwrap();
        assert_eq!(child, &LogicalType::Float);
        assert_eq!(size, 3);
        assert!(LogicalType::Integer.array_parts().is_none());
    }
}
