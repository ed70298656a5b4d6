//! Argument type codes and the value codec
//!
//! Every dynamic argument of a message is described by a one-letter type
//! code; a message's `argFormat` is the comma-separated list of those codes
//! (`"q,p,d"`). A code may name a tailer formatter plugin as `code@name`.
//!
//! | code | type   | wire                     |
//! |------|--------|--------------------------|
//! | `u`  | u8     | 1 byte                   |
//! | `s`  | u16    | 2 bytes                  |
//! | `i`  | i32    | 4 bytes                  |
//! | `q`  | i64    | 8 bytes                  |
//! | `Q`  | u64    | 8 bytes                  |
//! | `c`  | char   | 1 byte                   |
//! | `b`  | bool   | 1 byte                   |
//! | `f`  | f32    | 4 bytes                  |
//! | `d`  | f64    | 8 bytes                  |
//! | `p`  | string | length byte + ≤80 bytes  |
//!
//! Null arguments are flagged in the record's null mask and take no bytes.

use std::fmt;

/// Most dynamic arguments tracked per call; extra ones are dropped
pub const MAX_DYNAMIC_ARGS: usize = 16;

/// One-letter wire type of a dynamic argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    U8,
    U16,
    I32,
    I64,
    U64,
    Char,
    Bool,
    F32,
    F64,
    Str,
}

/// Compatibility class of a type code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Integer,
    Bool,
    Float,
    Text,
}

impl TypeCode {
    pub fn as_char(self) -> char {
        match self {
            TypeCode::U8 => 'u',
            TypeCode::U16 => 's',
            TypeCode::I32 => 'i',
            TypeCode::I64 => 'q',
            TypeCode::U64 => 'Q',
            TypeCode::Char => 'c',
            TypeCode::Bool => 'b',
            TypeCode::F32 => 'f',
            TypeCode::F64 => 'd',
            TypeCode::Str => 'p',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'u' => TypeCode::U8,
            's' => TypeCode::U16,
            'i' => TypeCode::I32,
            'q' => TypeCode::I64,
            'Q' => TypeCode::U64,
            'c' => TypeCode::Char,
            'b' => TypeCode::Bool,
            'f' => TypeCode::F32,
            'd' => TypeCode::F64,
            'p' => TypeCode::Str,
            _ => return None,
        })
    }

    /// Encoded width, `None` for length-prefixed strings
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            TypeCode::U8 | TypeCode::Char | TypeCode::Bool => Some(1),
            TypeCode::U16 => Some(2),
            TypeCode::I32 | TypeCode::F32 => Some(4),
            TypeCode::I64 | TypeCode::U64 | TypeCode::F64 => Some(8),
            TypeCode::Str => None,
        }
    }

    pub fn class(self) -> TypeClass {
        match self {
            TypeCode::U8
            | TypeCode::U16
            | TypeCode::I32
            | TypeCode::I64
            | TypeCode::U64
            | TypeCode::Char => TypeClass::Integer,
            TypeCode::Bool => TypeClass::Bool,
            TypeCode::F32 | TypeCode::F64 => TypeClass::Float,
            TypeCode::Str => TypeClass::Text,
        }
    }
}

/// One entry of an argFormat: a wire type plus an optional plugin name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormatSlot {
    pub code: TypeCode,
    pub plugin: Option<String>,
}

impl FormatSlot {
    pub fn new(code: TypeCode) -> Self {
        Self { code, plugin: None }
    }

    pub fn with_plugin(code: TypeCode, plugin: impl Into<String>) -> Self {
        Self {
            code,
            plugin: Some(plugin.into()),
        }
    }
}

impl fmt::Display for FormatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin {
            Some(name) => write!(f, "{}@{}", self.code.as_char(), name),
            None => write!(f, "{}", self.code.as_char()),
        }
    }
}

/// Ordered type codes of a message's dynamic arguments
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArgFormat(pub Vec<FormatSlot>);

impl ArgFormat {
    /// Parse `"q,p,i@errno"`; `None` on an unknown code
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() {
            return Some(Self::default());
        }
        text.split(',')
            .map(|token| {
                let (code, plugin) = match token.split_once('@') {
                    Some((code, name)) => (code, Some(name.to_string())),
                    None => (token, None),
                };
                let mut chars = code.chars();
                let c = chars.next()?;
                if chars.next().is_some() {
                    return None;
                }
                Some(FormatSlot {
                    code: TypeCode::from_char(c)?,
                    plugin,
                })
            })
            .collect::<Option<Vec<_>>>()
            .filter(|slots| slots.len() <= MAX_DYNAMIC_ARGS)
            .map(ArgFormat)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slots(&self) -> &[FormatSlot] {
        &self.0
    }

    /// Encode already-coerced values; returns the null mask
    ///
    /// Strings longer than `max_string_len` bytes are cut to exactly that
    /// many bytes.
    pub fn encode(&self, values: &[Value], max_string_len: usize, out: &mut Vec<u8>) -> u16 {
        let mut null_mask = 0u16;
        for (i, slot) in self.0.iter().enumerate() {
            let value = values.get(i).unwrap_or(&Value::Null);
            if value.is_null() {
                null_mask |= 1 << i;
                continue;
            }
            match (slot.code, value) {
                (TypeCode::U8, Value::U8(v)) | (TypeCode::Char, Value::Char(v)) => out.push(*v),
                (TypeCode::Bool, Value::Bool(v)) => out.push(*v as u8),
                (TypeCode::U16, Value::U16(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::I32, Value::I32(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::I64, Value::I64(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::U64, Value::U64(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::F32, Value::F32(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::F64, Value::F64(v)) => out.extend_from_slice(&v.to_le_bytes()),
                (TypeCode::Str, Value::Str(s)) => {
                    let bytes = s.as_bytes();
                    let n = bytes.len().min(max_string_len).min(u8::MAX as usize);
                    out.push(n as u8);
                    out.extend_from_slice(&bytes[..n]);
                }
                // Callers coerce first; anything else is recorded as null.
                _ => null_mask |= 1 << i,
            }
        }
        null_mask
    }

    /// Decode a payload; the payload must be consumed exactly
    pub fn decode(&self, null_mask: u16, payload: &[u8]) -> std::result::Result<Vec<Value>, String> {
        let mut values = Vec::with_capacity(self.0.len());
        let mut pos = 0usize;

        for (i, slot) in self.0.iter().enumerate() {
            if null_mask & (1 << i) != 0 {
                values.push(Value::Null);
                continue;
            }
            let width = match slot.code.fixed_width() {
                Some(w) => w,
                None => {
                    let n = *payload
                        .get(pos)
                        .ok_or_else(|| format!("payload ends before argument {}", i))?;
                    1 + n as usize
                }
            };
            let bytes = payload
                .get(pos..pos + width)
                .ok_or_else(|| format!("payload ends inside argument {}", i))?;
            values.push(Value::from_wire(slot.code, bytes));
            pos += width;
        }

        if pos != payload.len() {
            return Err(format!(
                "payload length {} does not match argument format (expected {})",
                payload.len(),
                pos
            ));
        }
        Ok(values)
    }
}

impl fmt::Display for ArgFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, slot) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", slot)?;
        }
        Ok(())
    }
}

/// A dynamic argument value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    U8(u8),
    U16(u16),
    I32(i32),
    I64(i64),
    U64(u64),
    Char(u8),
    Bool(bool),
    F32(f32),
    F64(f64),
    Str(String),
}

impl Value {
    /// Wire type of this value; `None` for null
    pub fn type_code(&self) -> Option<TypeCode> {
        Some(match self {
            Value::Null => return None,
            Value::U8(_) => TypeCode::U8,
            Value::U16(_) => TypeCode::U16,
            Value::I32(_) => TypeCode::I32,
            Value::I64(_) => TypeCode::I64,
            Value::U64(_) => TypeCode::U64,
            Value::Char(_) => TypeCode::Char,
            Value::Bool(_) => TypeCode::Bool,
            Value::F32(_) => TypeCode::F32,
            Value::F64(_) => TypeCode::F64,
            Value::Str(_) => TypeCode::Str,
        })
    }

    /// Type code registered for a first-seen value; null registers as a string
    pub fn registration_code(&self) -> TypeCode {
        self.type_code().unwrap_or(TypeCode::Str)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::U8(v) | Value::Char(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::U64(v) => *v as i128,
            _ => return None,
        })
    }

    /// Convert to a registered type code
    ///
    /// Null is compatible with every code. A string slot accepts any value
    /// in its printed form. Otherwise the value must share the slot's
    /// class; integers and floats are converted to the slot's width.
    /// Returns `None` on a class mismatch.
    pub fn coerce(&self, code: TypeCode) -> Option<Value> {
        if self.is_null() {
            return Some(Value::Null);
        }
        match code.class() {
            TypeClass::Text => Some(match self {
                Value::Str(s) => Value::Str(s.clone()),
                other => Value::Str(other.to_string()),
            }),
            TypeClass::Bool => match self {
                Value::Bool(b) => Some(Value::Bool(*b)),
                _ => None,
            },
            TypeClass::Float => match self {
                Value::F32(v) if code == TypeCode::F32 => Some(Value::F32(*v)),
                Value::F32(v) => Some(Value::F64(*v as f64)),
                Value::F64(v) if code == TypeCode::F64 => Some(Value::F64(*v)),
                Value::F64(v) => Some(Value::F32(*v as f32)),
                _ => None,
            },
            TypeClass::Integer => {
                let v = self.as_i128()?;
                Some(match code {
                    TypeCode::U8 => Value::U8(v as u8),
                    TypeCode::Char => Value::Char(v as u8),
                    TypeCode::U16 => Value::U16(v as u16),
                    TypeCode::I32 => Value::I32(v as i32),
                    TypeCode::I64 => Value::I64(v as i64),
                    _ => Value::U64(v as u64),
                })
            }
        }
    }

    /// Integer view used by hex and plugin rendering
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(*b as u64),
            other => other.as_i128().map(|v| v as u64),
        }
    }

    fn from_wire(code: TypeCode, bytes: &[u8]) -> Value {
        let mut b8 = [0u8; 8];
        match code {
            TypeCode::U8 => Value::U8(bytes[0]),
            TypeCode::Char => Value::Char(bytes[0]),
            TypeCode::Bool => Value::Bool(bytes[0] != 0),
            TypeCode::U16 => Value::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            TypeCode::I32 => Value::I32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            TypeCode::F32 => Value::F32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            TypeCode::I64 => {
                b8.copy_from_slice(&bytes[..8]);
                Value::I64(i64::from_le_bytes(b8))
            }
            TypeCode::U64 => {
                b8.copy_from_slice(&bytes[..8]);
                Value::U64(u64::from_le_bytes(b8))
            }
            TypeCode::F64 => {
                b8.copy_from_slice(&bytes[..8]);
                Value::F64(f64::from_le_bytes(b8))
            }
            TypeCode::Str => Value::Str(String::from_utf8_lossy(&bytes[1..]).into_owned()),
        }
    }
}

/// Python-style float text: six decimals, trailing zeros trimmed to one
pub fn float_text(v: f64) -> String {
    if !v.is_finite() {
        return if v.is_nan() {
            "nan".to_string()
        } else if v > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }
    let mut s = format!("{:.6}", v);
    if let Some(dot) = s.find('.') {
        let trimmed = s.trim_end_matches('0').len();
        s.truncate(trimmed.max(dot + 2));
    }
    s
}

/// Escaped text for a traced byte
pub fn char_text(c: u8) -> String {
    match c {
        b'\n' => "\\n".to_string(),
        b'\r' => "\\r".to_string(),
        b'\t' => "\\t".to_string(),
        b'\'' => "\\'".to_string(),
        b'\\' => "\\\\".to_string(),
        c if c.is_ascii_graphic() || c == b' ' => (c as char).to_string(),
        c => format!("\\x{:02x}", c),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::Char(c) => f.write_str(&char_text(*c)),
            Value::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Value::F32(v) => f.write_str(&float_text(*v as f64)),
            Value::F64(v) => f.write_str(&float_text(*v)),
            Value::Str(s) => f.write_str(s),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $conv)
                }
            }
        )*
    };
}

impl_from_value! {
    u8 => U8 as u8,
    u16 => U16 as u16,
    i8 => I32 as i32,
    i16 => I32 as i32,
    i32 => I32 as i32,
    u32 => I64 as i64,
    i64 => I64 as i64,
    isize => I64 as i64,
    u64 => U64 as u64,
    usize => U64 as u64,
    f32 => F32 as f32,
    f64 => F64 as f64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        if c.is_ascii() {
            Value::Char(c as u8)
        } else {
            Value::Str(c.to_string())
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
