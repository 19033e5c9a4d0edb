// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Structure values and type descriptors.
//!
//! A [`StructDef`] describes the shape of a process-variable value: an
//! ordered list of named fields, each a scalar or a nested structure. A
//! [`PvStructure`] is a value of that shape, carrying its descriptor by
//! `Arc` so snapshots, queue elements and subscribers all share one
//! definition.
//!
//! # Field positions
//!
//! Bit positions for changed/overrun accounting are assigned by one
//! deterministic depth-first walk of the descriptor, fixed here and used by
//! every producer and consumer:
//!
//! ```text
//! struct point2d        -> 0   (whole value)
//!   x:   int            -> 1
//!   y:   int            -> 2
//!   ts:  struct         -> 3   (whole substructure)
//!     sec:  long        -> 4
//!     nsec: int         -> 5
//! ```
//!
//! Setting a structure-node position selects its entire subtree.

use std::fmt;
use std::sync::Arc;

use super::BitSet;

/// Scalar field types understood by the gateway payload model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Boolean,
    Int,
    Long,
    Double,
    String,
}

/// A scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::Boolean(_) => ScalarKind::Boolean,
            ScalarValue::Int(_) => ScalarKind::Int,
            ScalarValue::Long(_) => ScalarKind::Long,
            ScalarValue::Double(_) => ScalarKind::Double,
            ScalarValue::String(_) => ScalarKind::String,
        }
    }

    fn default_of(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Boolean => ScalarValue::Boolean(false),
            ScalarKind::Int => ScalarValue::Int(0),
            ScalarKind::Long => ScalarValue::Long(0),
            ScalarKind::Double => ScalarValue::Double(0.0),
            ScalarKind::String => ScalarValue::String(String::new()),
        }
    }
}

/// Field entry of a [`StructDef`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDef {
    Scalar(ScalarKind),
    Structure(Arc<StructDef>),
}

impl FieldDef {
    /// Number of bit positions this field occupies (itself plus subtree).
    fn span(&self) -> usize {
        match self {
            FieldDef::Scalar(_) => 1,
            FieldDef::Structure(sd) => 1 + sd.member_span(),
        }
    }
}

/// Type descriptor: ordered named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    type_id: String,
    fields: Vec<(String, FieldDef)>,
}

impl StructDef {
    /// Start building a descriptor. `type_id` is a free-form tag carried on
    /// the wire (may be empty).
    pub fn builder(type_id: impl Into<String>) -> StructDefBuilder {
        StructDefBuilder {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    /// Descriptor with no fields. Used as the placeholder shape of
    /// pre-allocated queue slots before the first payload arrives.
    pub fn empty() -> Arc<StructDef> {
        Arc::new(StructDef {
            type_id: String::new(),
            fields: Vec::new(),
        })
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn fields(&self) -> &[(String, FieldDef)] {
        &self.fields
    }

    /// Bit positions occupied by members (excluding this node itself).
    fn member_span(&self) -> usize {
        self.fields.iter().map(|(_, f)| f.span()).sum()
    }

    /// Total bit positions for a value of this shape, including position 0.
    pub fn bit_capacity(&self) -> usize {
        1 + self.member_span()
    }

    /// Bit position of a dotted field path, or `None` if absent.
    pub fn offset_of(&self, path: &str) -> Option<usize> {
        let mut next = 1;
        Self::find_offset(&self.fields, path, &mut next)
    }

    fn find_offset(fields: &[(String, FieldDef)], path: &str, next: &mut usize) -> Option<usize> {
        for (name, def) in fields {
            let here = *next;
            *next += 1;
            match def {
                FieldDef::Scalar(_) => {
                    if name == path {
                        return Some(here);
                    }
                }
                FieldDef::Structure(sd) => {
                    if name == path {
                        return Some(here);
                    }
                    if let Some(rest) =
                        path.strip_prefix(name.as_str()).and_then(|r| r.strip_prefix('.'))
                    {
                        return Self::find_offset(&sd.fields, rest, next);
                    }
                    *next += sd.member_span();
                }
            }
        }
        None
    }
}

/// Builder for [`StructDef`], nesting with `begin_nested`/`end_nested`.
pub struct StructDefBuilder {
    type_id: String,
    fields: Vec<(String, FieldDef)>,
}

impl StructDefBuilder {
    pub fn add(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.fields.push((name.into(), FieldDef::Scalar(kind)));
        self
    }

    pub fn add_structure(mut self, name: impl Into<String>, def: Arc<StructDef>) -> Self {
        self.fields.push((name.into(), FieldDef::Structure(def)));
        self
    }

    pub fn build(self) -> Arc<StructDef> {
        Arc::new(StructDef {
            type_id: self.type_id,
            fields: self.fields,
        })
    }
}

/// A field slot of a [`PvStructure`].
#[derive(Debug, Clone, PartialEq)]
pub enum PvField {
    Scalar(ScalarValue),
    Structure(PvStructure),
}

/// A structure value: descriptor plus one value slot per field.
#[derive(Clone, PartialEq)]
pub struct PvStructure {
    dtype: Arc<StructDef>,
    fields: Vec<PvField>,
}

impl PvStructure {
    /// Default-initialized value of the given shape.
    pub fn new(dtype: Arc<StructDef>) -> Self {
        let fields = dtype
            .fields
            .iter()
            .map(|(_, def)| match def {
                FieldDef::Scalar(kind) => PvField::Scalar(ScalarValue::default_of(*kind)),
                FieldDef::Structure(sd) => PvField::Structure(PvStructure::new(Arc::clone(sd))),
            })
            .collect();
        Self { dtype, fields }
    }

    pub fn dtype(&self) -> &Arc<StructDef> {
        &self.dtype
    }

    /// Look up a dotted path.
    pub fn get(&self, path: &str) -> Option<&PvField> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        let index = self.dtype.fields.iter().position(|(n, _)| n == head)?;
        match (&self.fields[index], rest) {
            (field, None) => Some(field),
            (PvField::Structure(sub), Some(rest)) => sub.get(rest),
            (PvField::Scalar(_), Some(_)) => None,
        }
    }

    pub fn get_scalar(&self, path: &str) -> Option<&ScalarValue> {
        match self.get(path)? {
            PvField::Scalar(v) => Some(v),
            PvField::Structure(_) => None,
        }
    }

    pub fn get_int(&self, path: &str) -> Option<i32> {
        match self.get_scalar(path)? {
            ScalarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Store a scalar at a dotted path. Returns false when the path does not
    /// name a scalar field (the value is left unchanged).
    pub fn set_scalar(&mut self, path: &str, value: ScalarValue) -> bool {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        let Some(index) = self.dtype.fields.iter().position(|(n, _)| n == head) else {
            return false;
        };
        match (&mut self.fields[index], rest) {
            (PvField::Scalar(slot), None) => {
                *slot = value;
                true
            }
            (PvField::Structure(sub), Some(rest)) => sub.set_scalar(rest, value),
            _ => false,
        }
    }

    /// Copy fields indicated by `changed` from `other` into `self`.
    ///
    /// Position 0 (or a structure-node position) copies the whole subtree.
    /// Both values must share a descriptor; on shape mismatch the entire
    /// value is replaced, which is the type-change path.
    pub fn merge_from(&mut self, other: &PvStructure, changed: &BitSet) {
        if !Arc::ptr_eq(&self.dtype, &other.dtype) && self.dtype != other.dtype {
            *self = other.clone();
            return;
        }
        if changed.get(0) {
            self.fields = other.fields.clone();
            return;
        }
        let mut next = 1;
        Self::merge_fields(&mut self.fields, &other.fields, changed, &mut next, false);
    }

    fn merge_fields(
        dst: &mut [PvField],
        src: &[PvField],
        changed: &BitSet,
        next: &mut usize,
        copy_all: bool,
    ) {
        for (d, s) in dst.iter_mut().zip(src) {
            let here = *next;
            *next += 1;
            match (d, s) {
                (PvField::Scalar(dv), PvField::Scalar(sv)) => {
                    if copy_all || changed.get(here) {
                        *dv = sv.clone();
                    }
                }
                (PvField::Structure(dsub), PvField::Structure(ssub)) => {
                    let all = copy_all || changed.get(here);
                    Self::merge_fields(&mut dsub.fields, &ssub.fields, changed, next, all);
                }
                (d, s) => {
                    // shape drift inside a shared descriptor: replace the slot
                    *d = s.clone();
                }
            }
        }
    }

    /// Dotted paths of all leaf fields, in descriptor order.
    ///
    /// A nested structure with no members counts as one leaf; a request
    /// field mask uses that to select a whole substructure.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        Self::collect_leaves(&self.dtype.fields, "", &mut out);
        out
    }

    fn collect_leaves(fields: &[(String, FieldDef)], prefix: &str, out: &mut Vec<String>) {
        for (name, def) in fields {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            match def {
                FieldDef::Scalar(_) => out.push(path),
                FieldDef::Structure(sd) if sd.fields.is_empty() => out.push(path),
                FieldDef::Structure(sd) => Self::collect_leaves(&sd.fields, &path, out),
            }
        }
    }
}

impl fmt::Debug for PvStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for ((name, _), value) in self.dtype.fields.iter().zip(&self.fields) {
            map.entry(name, value);
        }
        map.finish()
    }
}
