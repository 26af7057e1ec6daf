//! Exemplar intersection: the narrowest exemplar satisfying both operands.

use crate::error::ContractError;
use crate::exemplar::Exemplar;
use std::collections::BTreeMap;

/// Intersect two exemplars.
///
/// `Passthrough` and `Wildcard` are neutral (except that `Wildcard` never
/// narrows to a lambda). Dictionaries keep the union of their keys, since a
/// value satisfying both must carry every key either one declares. Mismatched
/// kinds have no intersection.
pub fn intersect(left: &Exemplar, right: &Exemplar) -> Result<Exemplar, ContractError> {
    match (left, right) {
        (Exemplar::Passthrough, other) | (other, Exemplar::Passthrough) => Ok(other.clone()),
        (Exemplar::Wildcard, Exemplar::Lambda(_)) | (Exemplar::Lambda(_), Exemplar::Wildcard) => {
            Err(incompatible(left, right))
        }
        (Exemplar::Wildcard, other) | (other, Exemplar::Wildcard) => Ok(other.clone()),
        (Exemplar::Primitive(a), Exemplar::Primitive(b)) if a == b => Ok(left.clone()),
        (Exemplar::Dictionary(a), Exemplar::Dictionary(b)) => {
            if a.is_empty() {
                return Ok(right.clone());
            }
            if b.is_empty() {
                return Ok(left.clone());
            }
            let mut merged: BTreeMap<String, Exemplar> = BTreeMap::new();
            for (key, ex) in a {
                let narrowed = match b.get(key) {
                    Some(other) => intersect(ex, other)?,
                    None => ex.clone(),
                };
                merged.insert(key.clone(), narrowed);
            }
            for (key, ex) in b {
                merged.entry(key.clone()).or_insert_with(|| ex.clone());
            }
            Ok(Exemplar::Dictionary(merged))
        }
        (Exemplar::List(None), Exemplar::List(_)) => Ok(right.clone()),
        (Exemplar::List(_), Exemplar::List(None)) => Ok(left.clone()),
        (Exemplar::List(Some(a)), Exemplar::List(Some(b))) => {
            Ok(Exemplar::list_of(intersect(a, b)?))
        }
        (Exemplar::Lambda(a), Exemplar::Lambda(b)) => {
            if a == b || b.is_empty() {
                Ok(left.clone())
            } else if a.is_empty() {
                Ok(right.clone())
            } else {
                Err(incompatible(left, right))
            }
        }
        _ => Err(incompatible(left, right)),
    }
}

fn incompatible(left: &Exemplar, right: &Exemplar) -> ContractError {
    ContractError::IncompatibleIntersection {
        left: left.to_string(),
        right: right.to_string(),
    }
}
