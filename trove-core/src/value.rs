//! Typed property values.
//!
//! `InternalValue` is the stored representation of a property value: a
//! typed scalar or a binary payload. Binary values carry a content digest
//! and, until first committed, a transient spool allocation that must be
//! released exactly once before the value is superseded.

use crate::error::{RepositoryError, Result};
use crate::item::NodeId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    String,
    Long,
    Double,
    Boolean,
    Date,
    Name,
    Path,
    Reference,
    Binary,
    /// Placeholder in definitions only; never stored at rest
    Undefined,
}

impl PropertyType {
    /// Lowercase type name
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Long => "long",
            PropertyType::Double => "double",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Name => "name",
            PropertyType::Path => "path",
            PropertyType::Reference => "reference",
            PropertyType::Binary => "binary",
            PropertyType::Undefined => "undefined",
        }
    }
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transient spool allocation backing a freshly supplied binary value.
///
/// Clones share the allocation, so a release through any handle marks all
/// of them. `release` reports whether this call performed the release,
/// letting callers detect a double release instead of repeating it.
#[derive(Debug, Clone)]
pub struct TempBlob {
    released: Arc<AtomicBool>,
}

impl TempBlob {
    pub fn new() -> Self {
        Self {
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Release the allocation. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for TempBlob {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary property value: payload plus content digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryValue {
    /// Hex-encoded SHA-256 of the payload
    digest: String,
    data: Bytes,
    /// Spool allocation; present only until the value is committed or
    /// superseded
    #[serde(skip)]
    temp: Option<TempBlob>,
}

impl BinaryValue {
    /// Create a binary value from a payload, spooling it transiently
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let digest = hex::encode(Sha256::digest(&data));
        Self {
            digest,
            data,
            temp: Some(TempBlob::new()),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn temp(&self) -> Option<&TempBlob> {
        self.temp.as_ref()
    }

    /// Release the spool allocation, if any.
    ///
    /// Returns `true` when an allocation was released by this call.
    pub fn dispose(&mut self) -> bool {
        match self.temp.take() {
            Some(temp) => temp.release(),
            None => false,
        }
    }
}

impl PartialEq for BinaryValue {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

/// A single typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InternalValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Name(String),
    Path(String),
    Reference(NodeId),
    Binary(BinaryValue),
}

impl InternalValue {
    /// The concrete type of this value
    pub fn property_type(&self) -> PropertyType {
        match self {
            InternalValue::String(_) => PropertyType::String,
            InternalValue::Long(_) => PropertyType::Long,
            InternalValue::Double(_) => PropertyType::Double,
            InternalValue::Boolean(_) => PropertyType::Boolean,
            InternalValue::Date(_) => PropertyType::Date,
            InternalValue::Name(_) => PropertyType::Name,
            InternalValue::Path(_) => PropertyType::Path,
            InternalValue::Reference(_) => PropertyType::Reference,
            InternalValue::Binary(_) => PropertyType::Binary,
        }
    }

    /// Length of this value on the read surface: textual length for
    /// string/long/double, resolved name/path length, byte length for
    /// binary, -1 for types without a defined length.
    pub fn length(&self) -> i64 {
        match self {
            InternalValue::String(s) => s.len() as i64,
            InternalValue::Long(n) => n.to_string().len() as i64,
            InternalValue::Double(d) => d.to_string().len() as i64,
            InternalValue::Name(n) => n.len() as i64,
            InternalValue::Path(p) => p.len() as i64,
            InternalValue::Binary(b) => b.len() as i64,
            _ => -1,
        }
    }

    /// Textual rendering used by conversions to string and binary
    fn as_text(&self) -> Result<String> {
        Ok(match self {
            InternalValue::String(s) => s.clone(),
            InternalValue::Long(n) => n.to_string(),
            InternalValue::Double(d) => d.to_string(),
            InternalValue::Boolean(b) => b.to_string(),
            InternalValue::Date(d) => d.to_rfc3339(),
            InternalValue::Name(n) => n.clone(),
            InternalValue::Path(p) => p.clone(),
            InternalValue::Reference(id) => id.to_string(),
            InternalValue::Binary(b) => String::from_utf8(b.data().to_vec())
                .map_err(|e| RepositoryError::ValueFormat(format!("binary is not valid UTF-8: {}", e)))?,
        })
    }

    /// Convert this value to the target type.
    ///
    /// Unsupported or failed conversions are value-format errors.
    pub fn convert_to(&self, target: PropertyType) -> Result<InternalValue> {
        if self.property_type() == target {
            return Ok(self.clone());
        }
        match target {
            PropertyType::String => Ok(InternalValue::String(self.as_text()?)),
            PropertyType::Long => match self {
                InternalValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(InternalValue::Long)
                    .map_err(|e| RepositoryError::ValueFormat(format!("'{}' is not a long: {}", s, e))),
                InternalValue::Double(d) => Ok(InternalValue::Long(d.trunc() as i64)),
                InternalValue::Date(d) => Ok(InternalValue::Long(d.timestamp_millis())),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Double => match self {
                InternalValue::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(InternalValue::Double)
                    .map_err(|e| RepositoryError::ValueFormat(format!("'{}' is not a double: {}", s, e))),
                InternalValue::Long(n) => Ok(InternalValue::Double(*n as f64)),
                InternalValue::Date(d) => Ok(InternalValue::Double(d.timestamp_millis() as f64)),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Boolean => match self {
                InternalValue::String(s) => s
                    .trim()
                    .parse::<bool>()
                    .map(InternalValue::Boolean)
                    .map_err(|e| RepositoryError::ValueFormat(format!("'{}' is not a boolean: {}", s, e))),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Date => match self {
                InternalValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|d| InternalValue::Date(d.with_timezone(&Utc)))
                    .map_err(|e| RepositoryError::ValueFormat(format!("'{}' is not a date: {}", s, e))),
                InternalValue::Long(n) => DateTime::from_timestamp_millis(*n)
                    .map(InternalValue::Date)
                    .ok_or_else(|| RepositoryError::ValueFormat(format!("{} is out of range for a date", n))),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Name => match self {
                InternalValue::String(s) => {
                    if s.is_empty() || s.contains('/') {
                        Err(RepositoryError::ValueFormat(format!("'{}' is not a valid name", s)))
                    } else {
                        Ok(InternalValue::Name(s.clone()))
                    }
                }
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Path => match self {
                InternalValue::String(s) => Ok(InternalValue::Path(s.clone())),
                InternalValue::Name(n) => Ok(InternalValue::Path(n.clone())),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Reference => match self {
                InternalValue::String(s) => NodeId::parse(s.trim())
                    .map(InternalValue::Reference)
                    .map_err(|_| RepositoryError::ValueFormat(format!("'{}' is not a node identifier", s))),
                other => Err(conversion_error(other, target)),
            },
            PropertyType::Binary => {
                let text = self.as_text()?;
                Ok(InternalValue::Binary(BinaryValue::new(text.into_bytes())))
            }
            PropertyType::Undefined => Err(RepositoryError::ValueFormat(
                "cannot convert to an undefined type".to_string(),
            )),
        }
    }

    /// Release the spool allocation of a binary value, if any
    pub fn dispose(&mut self) -> bool {
        match self {
            InternalValue::Binary(b) => b.dispose(),
            _ => false,
        }
    }
}

fn conversion_error(value: &InternalValue, target: PropertyType) -> RepositoryError {
    RepositoryError::ValueFormat(format!(
        "cannot convert a {} value to {}",
        value.property_type(),
        target
    ))
}

/// Compact a value sequence: purge interior empty slots, keep the
/// relative order of the remaining values.
pub fn compact(values: Vec<Option<InternalValue>>) -> Vec<InternalValue> {
    values.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_long_string_roundtrip() {
        let v = InternalValue::Long(42);
        let s = v.convert_to(PropertyType::String).unwrap();
        assert_eq!(s, InternalValue::String("42".to_string()));
        let back = s.convert_to(PropertyType::Long).unwrap();
        assert_eq!(back, InternalValue::Long(42));
    }

    #[test]
    fn test_string_to_long_rejects_garbage() {
        let v = InternalValue::String("forty-two".to_string());
        assert!(matches!(
            v.convert_to(PropertyType::Long),
            Err(RepositoryError::ValueFormat(_))
        ));
    }

    #[test]
    fn test_date_conversions() {
        let millis = 1_700_000_000_000i64;
        let date = InternalValue::Long(millis).convert_to(PropertyType::Date).unwrap();
        assert_eq!(date.convert_to(PropertyType::Long).unwrap(), InternalValue::Long(millis));

        let text = date.convert_to(PropertyType::String).unwrap();
        let reparsed = text.convert_to(PropertyType::Date).unwrap();
        assert_eq!(reparsed, date);
    }

    #[test]
    fn test_boolean_to_date_is_value_format() {
        let v = InternalValue::Boolean(true);
        assert!(matches!(
            v.convert_to(PropertyType::Date),
            Err(RepositoryError::ValueFormat(_))
        ));
    }

    #[test]
    fn test_name_rejects_slash() {
        let v = InternalValue::String("a/b".to_string());
        assert!(v.convert_to(PropertyType::Name).is_err());
        let ok = InternalValue::String("title".to_string());
        assert_eq!(
            ok.convert_to(PropertyType::Name).unwrap(),
            InternalValue::Name("title".to_string())
        );
    }

    #[test]
    fn test_reference_conversion() {
        let id = NodeId::generate();
        let v = InternalValue::String(id.to_string());
        assert_eq!(
            v.convert_to(PropertyType::Reference).unwrap(),
            InternalValue::Reference(id)
        );
        assert!(InternalValue::String("xyz".to_string())
            .convert_to(PropertyType::Reference)
            .is_err());
    }

    #[test]
    fn test_lengths() {
        assert_eq!(InternalValue::String("hello".to_string()).length(), 5);
        assert_eq!(InternalValue::Long(1234).length(), 4);
        assert_eq!(InternalValue::Name("title".to_string()).length(), 5);
        assert_eq!(InternalValue::Path("/a/b".to_string()).length(), 4);
        assert_eq!(InternalValue::Binary(BinaryValue::new(vec![0u8; 16])).length(), 16);
        assert_eq!(InternalValue::Boolean(true).length(), -1);
        assert_eq!(InternalValue::Reference(NodeId::generate()).length(), -1);
    }

    #[test]
    fn test_binary_digest_stable() {
        let a = BinaryValue::new(b"payload".to_vec());
        let b = BinaryValue::new(b"payload".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a, b);
    }

    #[test]
    fn test_temp_blob_released_exactly_once() {
        let mut v = BinaryValue::new(b"payload".to_vec());
        let temp = v.temp().unwrap().clone();
        assert!(!temp.is_released());

        assert!(v.dispose());
        assert!(temp.is_released());

        // second dispose has nothing left to release
        assert!(!v.dispose());
    }

    #[test]
    fn test_temp_blob_shared_across_clones() {
        let v = BinaryValue::new(b"payload".to_vec());
        let mut copy = v.clone();
        assert!(copy.dispose());
        assert!(v.temp().unwrap().is_released());
    }

    #[test]
    fn test_compact_preserves_order() {
        let values = vec![
            Some(InternalValue::Long(1)),
            None,
            Some(InternalValue::Long(2)),
            None,
            Some(InternalValue::Long(3)),
        ];
        let compacted = compact(values);
        assert_eq!(
            compacted,
            vec![
                InternalValue::Long(1),
                InternalValue::Long(2),
                InternalValue::Long(3)
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_compact_drops_only_empty_slots(slots in proptest::collection::vec(
            proptest::option::of(any::<i64>()), 0..32
        )) {
            let values: Vec<Option<InternalValue>> =
                slots.iter().map(|s| s.map(InternalValue::Long)).collect();
            let compacted = compact(values);
            let expected: Vec<InternalValue> =
                slots.iter().flatten().map(|n| InternalValue::Long(*n)).collect();
            prop_assert_eq!(compacted, expected);
        }

        #[test]
        fn prop_long_survives_string_roundtrip(n in any::<i64>()) {
            let text = InternalValue::Long(n).convert_to(PropertyType::String).unwrap();
            let back = text.convert_to(PropertyType::Long).unwrap();
            prop_assert_eq!(back, InternalValue::Long(n));
        }
    }
}
