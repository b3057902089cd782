//! Typed device values and their wire representation.
//!
//! Every value travels as one tag byte followed by a little-endian payload:
//!
//! | Tag | Type | Payload | Width |
//! |-----|------|---------|-------|
//! | 0x01 | [`Value::Bool`] | 1 byte, 0 or 1 | bit |
//! | 0x04 | [`Value::I16`] | 2 bytes | word |
//! | 0x08 | [`Value::I32`] | 4 bytes | doubleword |
//! | 0x09 | [`Value::F32`] | 4 bytes (IEEE 754) | doubleword |
//! | 0x0A | [`Value::String`] | u16 byte length + UTF-8 bytes | word |
//!
//! A string occupies `ceil(len / 2)` consecutive words starting at the
//! address, so it must fit inside the device's range.
//!
//! # Example
//!
//! ```
//! use m700_nc::{decode, encode, resolve, Value};
//!
//! let addr = resolve("D200").unwrap();
//! let bytes = encode(&Value::I16(-42), &addr).unwrap();
//! assert_eq!(bytes, vec![0x04, 0xD6, 0xFF]);
//!
//! let decoded = decode(&bytes, &addr).unwrap();
//! assert_eq!(decoded.value(), &Value::I16(-42));
//!
//! // Strings cannot be stored in bit devices
//! assert!(encode(&Value::String("HI".into()), &resolve("M900").unwrap()).is_err());
//! ```

use crate::device::{AccessWidth, DeviceAddress};
use crate::error::{NcError, Result};

const TAG_BIT: u8 = 0x01;
const TAG_WORD: u8 = 0x04;
const TAG_DWORD: u8 = 0x08;
const TAG_REAL: u8 = 0x09;
const TAG_STRING: u8 = 0x0A;

/// Maximum encoded string length in bytes.
pub const MAX_STRING_BYTES: usize = 960;

/// A typed device value.
///
/// `F32` compares by IEEE equality, so a NaN never equals itself.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// Bit device state.
    Bool(bool),
    /// Signed 16-bit word.
    I16(i16),
    /// Signed 32-bit doubleword.
    I32(i32),
    /// IEEE 754 single-precision doubleword.
    F32(f32),
    /// Text stored two bytes per word.
    String(String),
}

impl Value {
    /// Returns the type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::I16(_) => ValueType::I16,
            Value::I32(_) => ValueType::I32,
            Value::F32(_) => ValueType::F32,
            Value::String(_) => ValueType::String,
        }
    }

    /// Returns the boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value widened to `i64` for the integer and bool variants.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::Value;
    ///
    /// assert_eq!(Value::Bool(true).as_i64(), Some(1));
    /// assert_eq!(Value::I16(-5).as_i64(), Some(-5));
    /// assert_eq!(Value::F32(1.5).as_i64(), None);
    /// ```
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Returns the float, if this is an `F32`.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", u8::from(*b)),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// Type tag of a [`Value`], used to request a representation on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// Boolean (bit devices).
    Bool,
    /// 16-bit integer (word devices).
    I16,
    /// 32-bit integer (word devices, doubleword access).
    I32,
    /// 32-bit float (word devices, doubleword access).
    F32,
    /// Text (word devices).
    String,
}

impl ValueType {
    /// Width a value of this type is stored with.
    pub fn width(self) -> AccessWidth {
        match self {
            ValueType::Bool => AccessWidth::Bit,
            ValueType::I16 | ValueType::String => AccessWidth::Word,
            ValueType::I32 | ValueType::F32 => AccessWidth::DoubleWord,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            ValueType::Bool => TAG_BIT,
            ValueType::I16 => TAG_WORD,
            ValueType::I32 => TAG_DWORD,
            ValueType::F32 => TAG_REAL,
            ValueType::String => TAG_STRING,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_BIT => Some(ValueType::Bool),
            TAG_WORD => Some(ValueType::I16),
            TAG_DWORD => Some(ValueType::I32),
            TAG_REAL => Some(ValueType::F32),
            TAG_STRING => Some(ValueType::String),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Bool => "bool",
            ValueType::I16 => "i16",
            ValueType::I32 => "i32",
            ValueType::F32 => "f32",
            ValueType::String => "string",
        };
        f.write_str(s)
    }
}

/// A value read from (or destined for) a specific device address.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawDeviceValue"))]
pub struct DeviceValue {
    address: DeviceAddress,
    value: Value,
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawDeviceValue {
    address: DeviceAddress,
    value: Value,
}

#[cfg(feature = "serde")]
impl TryFrom<RawDeviceValue> for DeviceValue {
    type Error = NcError;

    fn try_from(raw: RawDeviceValue) -> Result<Self> {
        Self::new(raw.address, raw.value)
    }
}

impl DeviceValue {
    /// Pairs a value with its address after checking they are compatible.
    ///
    /// # Errors
    ///
    /// Returns `NcError::TypeMismatch` if the value cannot live at `address`.
    pub fn new(address: DeviceAddress, value: Value) -> Result<Self> {
        check_compatible(&value, &address)?;
        Ok(Self { address, value })
    }

    /// Returns the address the value belongs to.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Returns the decoded value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes `self` and returns the value.
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl PartialEq<Value> for DeviceValue {
    fn eq(&self, other: &Value) -> bool {
        &self.value == other
    }
}

impl std::fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.address, self.value)
    }
}

fn check_compatible(value: &Value, address: &DeviceAddress) -> Result<()> {
    let found = value.value_type();
    if found.width() != address.width() {
        return Err(NcError::type_mismatch(
            address.to_string(),
            format!("{} {}", address.kind(), address.width()),
            found.to_string(),
        ));
    }
    if let Value::String(s) = value {
        if s.is_empty() {
            return Err(NcError::invalid_parameter("value", "string cannot be empty"));
        }
        if s.len() > MAX_STRING_BYTES {
            return Err(NcError::invalid_parameter(
                "value",
                format!(
                    "string too long: {} bytes, max is {}",
                    s.len(),
                    MAX_STRING_BYTES
                ),
            ));
        }
        let words = s.len().div_ceil(2) as u32;
        address.check_span(words)?;
    }
    Ok(())
}

/// Encodes `value` for storage at `address`.
///
/// # Errors
///
/// - `NcError::TypeMismatch` if the value's type does not match the
///   address width (a float for a bit device, a bool for a word device)
/// - `NcError::InvalidParameter` for empty or oversized strings
/// - `NcError::InvalidAddress` if a string runs past the device range
pub fn encode(value: &Value, address: &DeviceAddress) -> Result<Vec<u8>> {
    check_compatible(value, address)?;

    let mut bytes = Vec::with_capacity(8);
    bytes.push(value.value_type().tag());
    match value {
        Value::Bool(b) => bytes.push(u8::from(*b)),
        Value::I16(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        Value::I32(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        Value::F32(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        Value::String(s) => {
            bytes.extend_from_slice(&(s.len() as u16).to_le_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
    }
    Ok(bytes)
}

/// Decodes a value read from `address`.
///
/// Exact inverse of [`encode`]: `decode(&encode(v, a)?, a)?.value() == v`.
///
/// # Errors
///
/// Returns `NcError::ProtocolError` if the bytes are truncated, carry
/// trailing data, an unknown tag, a tag that does not fit the address
/// width, a bit byte other than 0/1, or invalid UTF-8.
pub fn decode(bytes: &[u8], address: &DeviceAddress) -> Result<DeviceValue> {
    let (&tag, payload) = bytes
        .split_first()
        .ok_or_else(|| NcError::protocol("empty device value"))?;
    let value_type = ValueType::from_tag(tag)
        .ok_or_else(|| NcError::protocol(format!("unknown value tag 0x{:02X}", tag)))?;
    if value_type.width() != address.width() {
        return Err(NcError::protocol(format!(
            "{} value returned for {} address {}",
            value_type,
            address.width(),
            address
        )));
    }

    let value = match value_type {
        ValueType::Bool => match fixed::<1>(payload)? {
            [0] => Value::Bool(false),
            [1] => Value::Bool(true),
            [b] => return Err(NcError::protocol(format!("invalid bit value 0x{:02X}", b))),
        },
        ValueType::I16 => Value::I16(i16::from_le_bytes(fixed(payload)?)),
        ValueType::I32 => Value::I32(i32::from_le_bytes(fixed(payload)?)),
        ValueType::F32 => Value::F32(f32::from_le_bytes(fixed(payload)?)),
        ValueType::String => {
            let (len, text) = payload
                .split_first_chunk::<2>()
                .ok_or_else(|| NcError::protocol("truncated string length"))?;
            let len = usize::from(u16::from_le_bytes(*len));
            if text.len() != len {
                return Err(NcError::protocol(format!(
                    "string length {} does not match {} payload bytes",
                    len,
                    text.len()
                )));
            }
            let text = std::str::from_utf8(text)
                .map_err(|e| NcError::protocol(format!("string is not UTF-8: {}", e)))?;
            Value::String(text.to_string())
        }
    };

    Ok(DeviceValue {
        address: *address,
        value,
    })
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload.try_into().map_err(|_| {
        NcError::protocol(format!(
            "expected {} value byte(s), got {}",
            N,
            payload.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::resolve;
    use proptest::prelude::*;

    fn dword(name: &str) -> DeviceAddress {
        resolve(name)
            .unwrap()
            .with_width(AccessWidth::DoubleWord)
            .unwrap()
    }

    #[test]
    fn test_encode_bool() {
        let addr = resolve("M900").unwrap();
        assert_eq!(encode(&Value::Bool(true), &addr).unwrap(), vec![0x01, 0x01]);
        assert_eq!(encode(&Value::Bool(false), &addr).unwrap(), vec![0x01, 0x00]);
    }

    #[test]
    fn test_encode_i32_little_endian() {
        let bytes = encode(&Value::I32(-123456), &dword("D100")).unwrap();
        assert_eq!(hex::encode(bytes), "08c01dfeff");
    }

    #[test]
    fn test_encode_f32() {
        let bytes = encode(&Value::F32(3.14159), &dword("D100")).unwrap();
        assert_eq!(hex::encode(bytes), "09d00f4940");
    }

    #[test]
    fn test_encode_string() {
        let bytes = encode(&Value::from("Hello"), &resolve("D10").unwrap()).unwrap();
        assert_eq!(hex::encode(bytes), "0a050048656c6c6f");
    }

    #[test]
    fn test_type_mismatch_before_anything_else() {
        let m900 = resolve("M900").unwrap();
        for value in [
            Value::I16(1),
            Value::I32(1),
            Value::F32(1.0),
            Value::from("ON"),
        ] {
            assert!(matches!(
                encode(&value, &m900),
                Err(NcError::TypeMismatch { .. })
            ));
        }
        assert!(matches!(
            encode(&Value::Bool(true), &resolve("D200").unwrap()),
            Err(NcError::TypeMismatch { .. })
        ));
        assert!(matches!(
            encode(&Value::I32(7), &resolve("D200").unwrap()),
            Err(NcError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_string_limits() {
        let addr = resolve("D0").unwrap();
        assert!(matches!(
            encode(&Value::from(""), &addr),
            Err(NcError::InvalidParameter { .. })
        ));
        // 3 bytes need 2 words: SD126..SD127 fits, SD127..SD128 does not.
        assert!(encode(&Value::from("abc"), &resolve("SD126").unwrap()).is_ok());
        assert!(matches!(
            encode(&Value::from("abc"), &resolve("SD127").unwrap()),
            Err(NcError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let d200 = resolve("D200").unwrap();
        let m900 = resolve("M900").unwrap();
        assert!(decode(&[], &d200).is_err());
        assert!(decode(&[0x77, 0x00], &d200).is_err());
        assert!(decode(&[0x04, 0x01], &d200).is_err());
        assert!(decode(&[0x04, 0x01, 0x02, 0x03], &d200).is_err());
        assert!(decode(&[0x01, 0x02], &m900).is_err());
        assert!(decode(&[0x01, 0x01], &d200).is_err());
        assert!(decode(&[0x0A, 0x03, 0x00, b'a'], &d200).is_err());
        assert!(decode(&[0x0A, 0x02, 0x00, 0xFF, 0xFE], &d200).is_err());
    }

    #[test]
    fn test_decode_reports_protocol_error() {
        let err = decode(&[0x01, 0x05], &resolve("M1").unwrap()).unwrap_err();
        assert!(matches!(err, NcError::ProtocolError { .. }));
    }

    #[test]
    fn test_device_value_eq_value() {
        let addr = resolve("M900").unwrap();
        let dv = decode(&[0x01, 0x01], &addr).unwrap();
        assert_eq!(dv, Value::Bool(true));
        assert_eq!(dv.address(), &addr);
        assert_eq!(dv.to_string(), "M900 = 1");
    }

    fn value_for(width: AccessWidth) -> BoxedStrategy<Value> {
        match width {
            AccessWidth::Bit => any::<bool>().prop_map(Value::Bool).boxed(),
            AccessWidth::Word => prop_oneof![
                any::<i16>().prop_map(Value::I16),
                "[ -~]{1,32}".prop_map(Value::String),
            ]
            .boxed(),
            AccessWidth::DoubleWord => prop_oneof![
                any::<i32>().prop_map(Value::I32),
                (-1.0e30f32..1.0e30f32).prop_map(Value::F32),
            ]
            .boxed(),
        }
    }

    fn compatible_pair() -> impl Strategy<Value = (Value, DeviceAddress)> {
        let addresses = prop_oneof![
            (0u32..=10239).prop_map(|i| format!("M{}", i)),
            (0u32..=127).prop_map(|i| format!("SM{}", i)),
            (0u32..=8000).prop_map(|i| format!("D{}", i)),
            (0u32..=8000).prop_map(|i| format!("R{}", i)),
            (0u32..=8000).prop_map(|i| format!("D{}:dword", i)),
        ];
        addresses.prop_flat_map(|name| {
            let addr = match name.strip_suffix(":dword") {
                Some(base) => dword(base),
                None => resolve(&name).unwrap(),
            };
            value_for(addr.width()).prop_map(move |v| (v, addr))
        })
    }

    proptest! {
        #[test]
        fn test_encode_decode_law((value, addr) in compatible_pair()) {
            let bytes = encode(&value, &addr).unwrap();
            let decoded = decode(&bytes, &addr).unwrap();
            prop_assert_eq!(decoded.address(), &addr);
            prop_assert_eq!(decoded.value(), &value);
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_device_value_json() {
        let value = DeviceValue::new(dword("D200"), Value::F32(12.5)).unwrap();
        let json = serde_json::to_string(&value).unwrap();
        let back: DeviceValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.address().width(), AccessWidth::DoubleWord);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_device_value_json_rejects_mismatch() {
        let json = r#"{"address":{"kind":"M","index":900,"width":"Bit"},"value":{"F32":1.5}}"#;
        let err = serde_json::from_str::<DeviceValue>(json).unwrap_err();
        assert!(err.to_string().contains("M900"));

        let json = r#"{"address":{"kind":"M","index":900,"width":"Bit"},"value":{"Bool":true}}"#;
        let ok: DeviceValue = serde_json::from_str(json).unwrap();
        assert_eq!(ok, Value::Bool(true));
    }
}
