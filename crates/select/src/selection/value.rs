//! Typed values produced by selection tree nodes.
//!
//! A node's value is one of five kinds: integer, real, or string vectors, a
//! position set, or an index group. The storage always matches the kind;
//! `nr` counts how many elements are currently valid and never exceeds the
//! buffer length.

use crate::selection::error::{Result, SelectionError};
use crate::selection::group::IndexGroup;

/// The kind of value a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    None,
    Int,
    Real,
    Str,
    Pos,
    Group,
}

impl ValueKind {
    /// Human-readable kind name for error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::None => "none",
            ValueKind::Int => "int",
            ValueKind::Real => "real",
            ValueKind::Str => "string",
            ValueKind::Pos => "position",
            ValueKind::Group => "group",
        }
    }
}

/// A set of reference positions together with the atoms they were computed
/// from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosSet {
    pub coords: Vec<[f64; 3]>,
    pub group: IndexGroup,
}

impl PosSet {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn copy_from(&mut self, src: &PosSet) {
        self.coords.clear();
        self.coords.extend_from_slice(&src.coords);
        self.group.copy_from(&src.group);
    }
}

/// Kind-tagged value storage.
#[derive(Debug, Clone)]
pub enum ValueData {
    None,
    Int(Vec<i64>),
    Real(Vec<f64>),
    Str(Vec<String>),
    Pos(PosSet),
    Group(IndexGroup),
}

impl ValueData {
    pub fn empty(kind: ValueKind) -> Self {
        match kind {
            ValueKind::None => ValueData::None,
            ValueKind::Int => ValueData::Int(Vec::new()),
            ValueKind::Real => ValueData::Real(Vec::new()),
            ValueKind::Str => ValueData::Str(Vec::new()),
            ValueKind::Pos => ValueData::Pos(PosSet::default()),
            ValueKind::Group => ValueData::Group(IndexGroup::new()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ValueData::None => ValueKind::None,
            ValueData::Int(_) => ValueKind::Int,
            ValueData::Real(_) => ValueKind::Real,
            ValueData::Str(_) => ValueKind::Str,
            ValueData::Pos(_) => ValueKind::Pos,
            ValueData::Group(_) => ValueKind::Group,
        }
    }

    /// Number of elements the storage can hold without growing.
    pub fn capacity(&self) -> usize {
        match self {
            ValueData::None => 0,
            ValueData::Int(v) => v.len(),
            ValueData::Real(v) => v.len(),
            ValueData::Str(v) => v.len(),
            ValueData::Pos(p) => p.len(),
            ValueData::Group(g) => g.len(),
        }
    }
}

/// A node's value: kind-tagged storage plus the current element count.
#[derive(Debug, Clone)]
pub struct SelValue {
    /// Number of valid elements in the storage.
    pub nr: usize,
    data: ValueData,
}

impl SelValue {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            nr: 0,
            data: ValueData::empty(kind),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.data.kind()
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ValueData {
        &mut self.data
    }

    /// Grow the storage so it can hold `count` elements. Vector kinds are
    /// length-extended with defaults so callbacks can write by index.
    pub fn reserve_for(&mut self, count: usize) {
        match &mut self.data {
            ValueData::None => {}
            ValueData::Int(v) => {
                if v.len() < count {
                    v.resize(count, 0);
                }
            }
            ValueData::Real(v) => {
                if v.len() < count {
                    v.resize(count, 0.0);
                }
            }
            ValueData::Str(v) => {
                if v.len() < count {
                    v.resize(count, String::new());
                }
            }
            ValueData::Pos(p) => {
                if p.coords.len() < count {
                    p.coords.resize(count, [0.0; 3]);
                }
            }
            ValueData::Group(_) => {}
        }
    }

    /// Move the storage out, leaving an empty buffer of the same kind.
    pub(crate) fn take_data(&mut self) -> ValueData {
        let kind = self.kind();
        std::mem::replace(&mut self.data, ValueData::empty(kind))
    }

    /// Install storage moved from elsewhere; the kind must not change.
    pub(crate) fn replace_data(&mut self, data: ValueData) -> ValueData {
        debug_assert_eq!(self.kind(), data.kind(), "value storage kind changed");
        std::mem::replace(&mut self.data, data)
    }

    fn kind_error(&self, want: ValueKind) -> SelectionError {
        SelectionError::internal(format!(
            "expected a {} value, found {}",
            want.name(),
            self.kind().name()
        ))
    }

    pub fn ints(&self) -> Result<&[i64]> {
        match &self.data {
            ValueData::Int(v) => Ok(v),
            _ => Err(self.kind_error(ValueKind::Int)),
        }
    }

    pub fn ints_mut(&mut self) -> Result<&mut [i64]> {
        match &mut self.data {
            ValueData::Int(v) => Ok(v),
            _ => Err(SelectionError::internal("expected an int value")),
        }
    }

    pub fn reals(&self) -> Result<&[f64]> {
        match &self.data {
            ValueData::Real(v) => Ok(v),
            _ => Err(self.kind_error(ValueKind::Real)),
        }
    }

    pub fn reals_mut(&mut self) -> Result<&mut [f64]> {
        match &mut self.data {
            ValueData::Real(v) => Ok(v),
            _ => Err(SelectionError::internal("expected a real value")),
        }
    }

    pub fn strings(&self) -> Result<&[String]> {
        match &self.data {
            ValueData::Str(v) => Ok(v),
            _ => Err(self.kind_error(ValueKind::Str)),
        }
    }

    pub fn strings_mut(&mut self) -> Result<&mut [String]> {
        match &mut self.data {
            ValueData::Str(v) => Ok(v),
            _ => Err(SelectionError::internal("expected a string value")),
        }
    }

    pub fn positions(&self) -> Result<&PosSet> {
        match &self.data {
            ValueData::Pos(p) => Ok(p),
            _ => Err(self.kind_error(ValueKind::Pos)),
        }
    }

    pub fn positions_mut(&mut self) -> Result<&mut PosSet> {
        match &mut self.data {
            ValueData::Pos(p) => Ok(p),
            _ => Err(SelectionError::internal("expected a position value")),
        }
    }

    pub fn group(&self) -> Result<&IndexGroup> {
        match &self.data {
            ValueData::Group(g) => Ok(g),
            _ => Err(self.kind_error(ValueKind::Group)),
        }
    }

    pub fn group_mut(&mut self) -> Result<&mut IndexGroup> {
        match &mut self.data {
            ValueData::Group(g) => Ok(g),
            _ => Err(SelectionError::internal("expected a group value")),
        }
    }

    /// Move a group value out, leaving an empty group in its place.
    pub(crate) fn take_group(&mut self) -> Result<IndexGroup> {
        match &mut self.data {
            ValueData::Group(g) => Ok(std::mem::take(g)),
            _ => Err(self.kind_error(ValueKind::Group)),
        }
    }

    /// Put a group value back after [`take_group`].
    ///
    /// [`take_group`]: SelValue::take_group
    pub(crate) fn put_group(&mut self, group: IndexGroup) {
        if let ValueData::Group(g) = &mut self.data {
            *g = group;
        }
    }
}
