// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload model: structure values, type descriptors and field bitsets.
//!
//! Every monitor delivery is a triple of a structure value plus two bitsets
//! over its field positions:
//!
//! - **changed**: fields carrying new data in this delivery
//! - **overrun**: fields that changed more than once since the previous
//!   delivery (coalescing evidence)
//!
//! The two are distinct on purpose; see [`BitSet::or_and`] for how overrun
//! bits are derived while deliveries coalesce.

mod bitset;
mod value;

pub use bitset::BitSet;
pub use value::{
    FieldDef, PvField, PvStructure, ScalarKind, ScalarValue, StructDef, StructDefBuilder,
};
