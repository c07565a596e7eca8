//! Dirty-tracked field records.
//!
//! A [`PropertyContainer`] holds the values of a fixed schema of named fields
//! and remembers which of them changed since the last load or store. Storage
//! code uses [`PropertyContainer::modified_fields`] to write only changed
//! columns, and [`PropertyContainer::has_been_modified`] is a single mask test.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{BemError, Result};

/// A single field value, mirroring the SQL storage classes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Blob(b) => Some(b),
            FieldValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Blob(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Blob(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// The fixed field list of a record type.
pub trait RecordSchema {
    /// Record name, also used as the table name.
    const NAME: &'static str;
    /// Declared fields, in storage column order. At most 64.
    const FIELDS: &'static [&'static str];

    /// Declared default for a field.
    fn default_value(_field: &str) -> FieldValue {
        FieldValue::Null
    }
}

/// Field values of one record plus its dirty set.
pub struct PropertyContainer<S: RecordSchema> {
    values: Vec<FieldValue>,
    modified: u64,
    _schema: PhantomData<S>,
}

impl<S: RecordSchema> PropertyContainer<S> {
    /// A record holding every declared default, with nothing marked modified.
    pub fn new() -> Self {
        debug_assert!(S::FIELDS.len() <= 64, "{} declares too many fields", S::NAME);
        Self {
            values: S::FIELDS.iter().map(|f| S::default_value(f)).collect(),
            modified: 0,
            _schema: PhantomData,
        }
    }

    fn index_of(field: &str) -> Result<usize> {
        S::FIELDS
            .iter()
            .position(|f| *f == field)
            .ok_or_else(|| BemError::UnknownField {
                record: S::NAME,
                field: field.to_string(),
            })
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        Ok(&self.values[Self::index_of(field)?])
    }

    /// Set a field; returns whether the stored value changed.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<bool> {
        let idx = Self::index_of(field)?;
        let value = value.into();
        if self.values[idx] == value {
            return Ok(false);
        }
        self.values[idx] = value;
        self.modified |= 1 << idx;
        Ok(true)
    }

    /// Replace values without touching the dirty set (hydration from storage).
    pub fn load_values<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        for (field, value) in values {
            let idx = Self::index_of(&field)?;
            self.values[idx] = value;
        }
        Ok(())
    }

    pub fn has_been_modified(&self) -> bool {
        self.modified != 0
    }

    pub fn is_modified(&self, field: &str) -> Result<bool> {
        Ok(self.modified & (1 << Self::index_of(field)?) != 0)
    }

    pub fn mark_unmodified(&mut self) {
        self.modified = 0;
    }

    /// Flag every field whose value differs from its declared default.
    pub fn mark_non_defaults_modified(&mut self) {
        for (idx, field) in S::FIELDS.iter().enumerate() {
            if self.values[idx] != S::default_value(field) {
                self.modified |= 1 << idx;
            }
        }
    }

    pub fn modified_fields(&self) -> Vec<&'static str> {
        S::FIELDS
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.modified & (1 << idx) != 0)
            .map(|(_, f)| *f)
            .collect()
    }

    /// Changed fields with their current values, in schema order.
    pub fn modified_values(&self) -> Vec<(&'static str, &FieldValue)> {
        self.modified_fields()
            .into_iter()
            .filter_map(|f| Self::index_of(f).ok().map(|idx| (f, &self.values[idx])))
            .collect()
    }

    pub fn all_fields_for_persistence(&self) -> Vec<(&'static str, &FieldValue)> {
        S::FIELDS.iter().copied().zip(self.values.iter()).collect()
    }
}

impl<S: RecordSchema> Default for PropertyContainer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RecordSchema> Clone for PropertyContainer<S> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            modified: self.modified,
            _schema: PhantomData,
        }
    }
}

impl<S: RecordSchema> fmt::Debug for PropertyContainer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (field, value) in self.all_fields_for_persistence() {
            map.entry(&field, value);
        }
        map.finish()
    }
}
