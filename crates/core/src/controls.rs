use std::collections::HashMap;

use smallvec::SmallVec;

/// Strongly typed control identifier.
///
/// # Example
/// ```rust
/// use iris_core::prelude::ControlId;
///
/// let id = ControlId(42);
/// assert_eq!(id.0, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlId(pub u32);

/// Identifiers for the controls the pipeline itself knows about.
///
/// Sensor drivers advertise their own ids through the control-info map;
/// these cover what the camera registers and what the 3A reports back.
pub mod ids {
    use super::ControlId;

    pub const AE_ENABLE: ControlId = ControlId(0x0001);
    pub const EXPOSURE: ControlId = ControlId(0x0002);
    pub const ANALOGUE_GAIN: ControlId = ControlId(0x0003);
}

/// Control value variants with minimal footprint.
///
/// # Example
/// ```rust
/// use iris_core::prelude::ControlValue;
///
/// let v = ControlValue::Bool(true);
/// assert_eq!(v, ControlValue::Bool(true));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "value", rename_all = "snake_case"))]
pub enum ControlValue {
    /// No value.
    None,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i32),
    /// Unsigned integer.
    Uint(u32),
    /// Floating-point value.
    Float(f32),
}

/// Accepted range and default for a single control.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{ControlInfo, ControlValue};
///
/// let info = ControlInfo::new(
///     ControlValue::Uint(0),
///     ControlValue::Uint(255),
///     ControlValue::Uint(16),
/// );
/// assert!(info.accepts(&ControlValue::Uint(32)));
/// assert!(!info.accepts(&ControlValue::Int(32)));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlInfo {
    pub min: ControlValue,
    pub max: ControlValue,
    pub default: ControlValue,
}

impl ControlInfo {
    pub fn new(min: ControlValue, max: ControlValue, default: ControlValue) -> Self {
        Self { min, max, default }
    }

    /// Range check respecting the variant; mismatched variants are rejected.
    pub fn accepts(&self, candidate: &ControlValue) -> bool {
        match (candidate, &self.min, &self.max) {
            (ControlValue::Bool(v), ControlValue::Bool(min), ControlValue::Bool(max)) => {
                (*v as u8) >= (*min as u8) && (*v as u8) <= (*max as u8)
            }
            (ControlValue::Int(v), ControlValue::Int(min), ControlValue::Int(max)) => {
                v >= min && v <= max
            }
            (ControlValue::Uint(v), ControlValue::Uint(min), ControlValue::Uint(max)) => {
                v >= min && v <= max
            }
            (ControlValue::Float(v), ControlValue::Float(min), ControlValue::Float(max)) => {
                v >= min && v <= max
            }
            (ControlValue::None, ControlValue::None, ControlValue::None) => true,
            _ => false,
        }
    }
}

/// Supported controls of an entity, keyed by id.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{ControlId, ControlInfo, ControlInfoMap, ControlValue};
///
/// let mut map = ControlInfoMap::new();
/// map.insert(
///     ControlId(1),
///     ControlInfo::new(ControlValue::Bool(false), ControlValue::Bool(true), ControlValue::Bool(true)),
/// );
/// assert!(map.contains(ControlId(1)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlInfoMap {
    entries: HashMap<u32, ControlInfo>,
}

impl ControlInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ControlId, info: ControlInfo) {
        self.entries.insert(id.0, info);
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlInfo> {
        self.entries.get(&id.0)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.entries.contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, &ControlInfo)> {
        self.entries.iter().map(|(id, info)| (ControlId(*id), info))
    }
}

impl FromIterator<(ControlId, ControlInfo)> for ControlInfoMap {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlInfo)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(id, info)| (id.0, info)).collect(),
        }
    }
}

/// Ordered set of control assignments.
///
/// Used for the user controls carried by a request, the sensor controls
/// produced by the 3A, and the per-frame result metadata. Insertion order
/// is preserved; inserting an existing id replaces its value in place.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{ControlId, ControlList, ControlValue};
///
/// let mut list = ControlList::new();
/// list.set(ControlId(7), ControlValue::Int(-2));
/// list.set(ControlId(7), ControlValue::Int(3));
/// assert_eq!(list.get(ControlId(7)), Some(&ControlValue::Int(3)));
/// assert_eq!(list.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlList {
    entries: SmallVec<[(ControlId, ControlValue); 8]>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `id` to `value`, replacing any previous assignment.
    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        if let Some(entry) = self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = value;
        } else {
            self.entries.push((id, value));
        }
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, &ControlValue)> {
        self.entries.iter().map(|(id, value)| (*id, value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(ControlId, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlValue)>>(iter: T) -> Self {
        let mut list = ControlList::new();
        for (id, value) in iter {
            list.set(id, value);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_rejects_variant_mismatch() {
        let info = ControlInfo::new(
            ControlValue::Int(-10),
            ControlValue::Int(10),
            ControlValue::Int(0),
        );
        assert!(info.accepts(&ControlValue::Int(10)));
        assert!(!info.accepts(&ControlValue::Int(11)));
        assert!(!info.accepts(&ControlValue::Uint(5)));
    }

    #[test]
    fn list_replaces_in_place() {
        let mut list = ControlList::new();
        list.set(ids::EXPOSURE, ControlValue::Int(100));
        list.set(ids::ANALOGUE_GAIN, ControlValue::Int(1));
        list.set(ids::EXPOSURE, ControlValue::Int(200));

        let order: Vec<ControlId> = list.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids::EXPOSURE, ids::ANALOGUE_GAIN]);
        assert_eq!(list.get(ids::EXPOSURE), Some(&ControlValue::Int(200)));
    }

    #[test]
    fn list_collects_from_pairs() {
        let list: ControlList = [
            (ControlId(1), ControlValue::Bool(true)),
            (ControlId(1), ControlValue::Bool(false)),
        ]
        .into_iter()
        .collect();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(ControlId(1)), Some(&ControlValue::Bool(false)));
    }
}
