//! Parameter values for the Extended Query Protocol.
//!
//! Everything travels in text format; `PgValue::Null` becomes the wire-level
//! NULL (length -1) in the Bind message.

/// A value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Text(String),
}

impl PgValue {
    /// Encode this value as text-format bytes for use as a query parameter.
    pub fn to_text_bytes(&self) -> Option<Vec<u8>> {
        match self {
            PgValue::Null => None,
            PgValue::Bool(b) => Some(if *b { b"t".to_vec() } else { b"f".to_vec() }),
            PgValue::Int4(v) => Some(v.to_string().into_bytes()),
            PgValue::Int8(v) => Some(v.to_string().into_bytes()),
            PgValue::Text(s) => Some(s.as_bytes().to_vec()),
        }
    }
}

pub trait ToParam {
    fn to_param(&self) -> PgValue;
}

impl ToParam for i32 {
    fn to_param(&self) -> PgValue {
        PgValue::Int4(*self)
    }
}

impl ToParam for i64 {
    fn to_param(&self) -> PgValue {
        PgValue::Int8(*self)
    }
}

impl ToParam for &str {
    fn to_param(&self) -> PgValue {
        PgValue::Text(self.to_string())
    }
}

impl ToParam for String {
    fn to_param(&self) -> PgValue {
        PgValue::Text(self.clone())
    }
}

impl ToParam for bool {
    fn to_param(&self) -> PgValue {
        PgValue::Bool(*self)
    }
}

impl<T: ToParam> ToParam for Option<T> {
    fn to_param(&self) -> PgValue {
        match self {
            Some(v) => v.to_param(),
            None => PgValue::Null,
        }
    }
}

impl ToParam for PgValue {
    fn to_param(&self) -> PgValue {
        self.clone()
    }
}
