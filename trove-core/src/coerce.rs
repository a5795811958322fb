//! Type resolution and coercion for property assignment.
//!
//! Resolves the concrete type a supplied value sequence must take, then
//! converts every element to it. All failures happen before any state is
//! mutated.

use crate::error::{RepositoryError, Result};
use crate::item::NodeId;
use crate::value::{InternalValue, PropertyType};
use async_trait::async_trait;

/// Contract used to validate reference targets
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    /// Whether the node exists and carries a stable referenceable identity
    async fn is_referenceable(&self, id: NodeId) -> bool;
}

/// Resolve the concrete type for a supplied value sequence.
///
/// A definition with a concrete required type wins. `Undefined` adopts the
/// first non-null supplied value's type; every other non-null element must
/// then share that exact type. With no values to adopt from, the type
/// falls back to string.
pub fn resolve_type(
    required: PropertyType,
    supplied: &[Option<InternalValue>],
) -> Result<PropertyType> {
    if required != PropertyType::Undefined {
        return Ok(required);
    }
    let mut adopted = None;
    for value in supplied.iter().flatten() {
        let t = value.property_type();
        match adopted {
            None => adopted = Some(t),
            Some(first) if first != t => {
                return Err(RepositoryError::ValueFormat(format!(
                    "inhomogeneous value types: {} vs {}",
                    first, t
                )));
            }
            _ => {}
        }
    }
    Ok(adopted.unwrap_or(PropertyType::String))
}

/// Coerce a supplied value sequence to the resolved type.
///
/// Slot positions are preserved; compaction is the overlay's job.
/// Reference values are validated against the resolver: a reference to a
/// node without a referenceable identity is a value-format error.
pub async fn coerce_values(
    supplied: &[Option<InternalValue>],
    required: PropertyType,
    refs: &dyn ReferenceResolver,
) -> Result<(PropertyType, Vec<Option<InternalValue>>)> {
    let target = resolve_type(required, supplied)?;
    let mut out = Vec::with_capacity(supplied.len());
    for slot in supplied {
        match slot {
            None => out.push(None),
            Some(value) => {
                let converted = value.convert_to(target)?;
                if let InternalValue::Reference(node) = &converted {
                    if !refs.is_referenceable(*node).await {
                        return Err(RepositoryError::ValueFormat(format!(
                            "reference target {} is not referenceable",
                            node
                        )));
                    }
                }
                out.push(Some(converted));
            }
        }
    }
    Ok((target, out))
}
