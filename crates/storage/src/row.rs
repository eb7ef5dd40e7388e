//! Rows: field name to field value
//!
//! Names are always [`VolatileString`]s; a map interns them when a row is
//! stored and hands them back as volatile copies when it is read. Values
//! keep whatever representation they were given, so a row read from a
//! [`DurableMap`](crate::DurableMap) holds durable values that can be put
//! back without copying.

use crate::field::{Field, IntoRepresentation};
use nvbench_core::{Result, VolatileString};
use nvbench_pmem::BlockHandle;
use rustc_hash::FxHashMap;
use std::collections::HashMap;

/// One record
#[derive(Debug, Clone, Default)]
pub struct Row {
    fields: FxHashMap<VolatileString, Field>,
}

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty row with room for `capacity` fields
    pub fn with_capacity(capacity: usize) -> Self {
        Row {
            fields: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Row of plain text fields
    pub fn from_strings<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        fields
            .into_iter()
            .map(|(k, v)| (VolatileString::from(k.as_ref()), Field::from(v.as_ref())))
            .collect()
    }

    /// Set a field, returning the value it replaces
    pub fn insert(
        &mut self,
        name: impl Into<VolatileString>,
        value: impl Into<Field>,
    ) -> Option<Field> {
        self.fields.insert(name.into(), value.into())
    }

    /// Value of a field
    pub fn get(&self, name: &[u8]) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Remove a field
    pub fn remove(&mut self, name: &[u8]) -> Option<Field> {
        self.fields.remove(name)
    }

    /// True if the row has a field named `name`
    pub fn contains(&self, name: &[u8]) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the row has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&VolatileString, &Field)> {
        self.fields.iter()
    }

    /// Keep only the named fields
    ///
    /// Names that the row lacks are ignored.
    pub fn project<S: AsRef<str>>(mut self, names: &[S]) -> Row {
        self.fields
            .retain(|name, _| names.iter().any(|n| n.as_ref().as_bytes() == name.remaining()));
        self
    }

    /// Plain text copy of every field, without consuming the values
    ///
    /// Non-UTF-8 bytes decode to U+FFFD.
    pub fn to_string_map(&self) -> Result<HashMap<String, String>> {
        self.fields
            .iter()
            .map(|(name, value)| Ok((name.to_lossy_string(), value.to_lossy_string()?)))
            .collect()
    }

    /// Row with every value moved into process memory
    pub fn into_volatile(self) -> Result<Row> {
        self.fields
            .into_iter()
            .map(|(name, value)| Ok((name, Field::Volatile(value.into_volatile()?))))
            .collect()
    }

    /// Blocks of the durable values
    pub fn durable_handles(&self) -> Vec<BlockHandle> {
        self.fields
            .values()
            .filter_map(|v| v.as_durable().map(|d| d.handle()))
            .collect()
    }

    /// Invalidate every durable value (no fence)
    ///
    /// Returns how many blocks changed state. This is the caller's half of
    /// a removal: the map unlinks the row, the caller retires its values.
    pub fn invalidate_values(&self) -> Result<usize> {
        let mut invalidated = 0;
        for value in self.fields.values() {
            if let Some(d) = value.as_durable() {
                if d.invalidate()? {
                    invalidated += 1;
                }
            }
        }
        Ok(invalidated)
    }
}

impl IntoIterator for Row {
    type Item = (VolatileString, Field);
    type IntoIter = std::collections::hash_map::IntoIter<VolatileString, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = (&'a VolatileString, &'a Field);
    type IntoIter = std::collections::hash_map::Iter<'a, VolatileString, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<(VolatileString, Field)> for Row {
    fn from_iter<I: IntoIterator<Item = (VolatileString, Field)>>(iter: I) -> Self {
        Row {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Extend<(VolatileString, Field)> for Row {
    fn extend<I: IntoIterator<Item = (VolatileString, Field)>>(&mut self, iter: I) {
        self.fields.extend(iter)
    }
}
