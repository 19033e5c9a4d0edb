// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Normalized subscription requests.
//!
//! A client's monitor request arrives as a structure value with an optional
//! `record._options` substructure and an optional `field` mask. Two requests
//! that would produce identical upstream traffic normalize to equal
//! [`RequestSignature`]s, which is what lets a channel entry share one
//! upstream subscription between many downstream subscribers.
//!
//! Recognized options (everything else is ignored):
//!
//! | option | type | effect |
//! |---|---|---|
//! | `record._options.queueSize` | integer string or integer | queue depth, clamped to >= 2 |
//! | `record._options.pipeline`  | boolean or boolean string | credit-based flow control |
//! | `record._options.atomic`    | boolean or boolean string | consistent grouped snapshot |
//! | `field`                     | structure | subset of the value delivered |
//!
//! `queueSize` as a *string* is a protocol quirk: the options structure is
//! string-typed on the wire, so `"3"` and `3` must both parse.

use crate::config::{DEFAULT_QUEUE_SIZE, MIN_QUEUE_SIZE};
use crate::gateway::{Error, Result};
use crate::pvdata::{PvField, PvStructure, ScalarValue};

/// Canonical form of a monitor request, used as the upstream dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature {
    queue_size: usize,
    pipeline: bool,
    atomic: bool,
    /// Sorted leaf paths of the `field` mask; empty means the whole value.
    field_mask: Vec<String>,
}

impl Default for RequestSignature {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            pipeline: false,
            atomic: false,
            field_mask: Vec::new(),
        }
    }
}

impl RequestSignature {
    /// Parse and normalize a request structure.
    ///
    /// # Errors
    ///
    /// `Error::ProtocolError` when a recognized option carries a value that
    /// cannot be interpreted (the create call fails synchronously).
    pub fn from_request(request: &PvStructure) -> Result<Self> {
        let mut sig = RequestSignature::default();

        if let Some(field) = request.get("record._options.queueSize") {
            sig.queue_size = parse_queue_size(field)?.max(MIN_QUEUE_SIZE);
        }
        if let Some(field) = request.get("record._options.pipeline") {
            sig.pipeline = parse_bool(field, "pipeline")?;
        }
        if let Some(field) = request.get("record._options.atomic") {
            sig.atomic = parse_bool(field, "atomic")?;
        }
        if let Some(field) = request.get("field") {
            match field {
                PvField::Structure(mask) => {
                    sig.field_mask = mask.leaf_paths();
                    sig.field_mask.sort();
                }
                PvField::Scalar(_) => {
                    return Err(Error::ProtocolError(
                        "field mask must be a structure".into(),
                    ));
                }
            }
        }

        Ok(sig)
    }

    /// Signature with only a queue size, the common test/tooling shape.
    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(MIN_QUEUE_SIZE),
            ..Self::default()
        }
    }

    /// Enable credit-based flow control on this signature.
    #[must_use]
    pub fn pipelined(mut self) -> Self {
        self.pipeline = true;
        self
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    pub fn atomic(&self) -> bool {
        self.atomic
    }

    pub fn field_mask(&self) -> &[String] {
        &self.field_mask
    }
}

fn parse_queue_size(field: &PvField) -> Result<usize> {
    match field {
        PvField::Scalar(ScalarValue::String(s)) => s.trim().parse::<usize>().map_err(|_| {
            Error::ProtocolError(format!("queueSize not an integer: {:?}", s))
        }),
        PvField::Scalar(ScalarValue::Int(v)) => usize::try_from(*v)
            .map_err(|_| Error::ProtocolError(format!("queueSize negative: {}", v))),
        PvField::Scalar(ScalarValue::Long(v)) => usize::try_from(*v)
            .map_err(|_| Error::ProtocolError(format!("queueSize negative: {}", v))),
        other => Err(Error::ProtocolError(format!(
            "queueSize has unusable type: {:?}",
            other
        ))),
    }
}

fn parse_bool(field: &PvField, option: &str) -> Result<bool> {
    match field {
        PvField::Scalar(ScalarValue::Boolean(v)) => Ok(*v),
        PvField::Scalar(ScalarValue::String(s)) => match s.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(Error::ProtocolError(format!(
                "{} not a boolean: {:?}",
                option, other
            ))),
        },
        other => Err(Error::ProtocolError(format!(
            "{} has unusable type: {:?}",
            option, other
        ))),
    }
}
