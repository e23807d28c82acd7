use crate::spec::Spec;
use crate::types::{ShortId, SpecId};
use serde::Serialize;

/// Deterministic identity of a spec, derived from its content.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SpecIdentity {
    pub spec_id: SpecId,
    pub short_id: ShortId,
}

/// Hash the canonical JSON form of a spec.
///
/// All maps in [`Spec`] are ordered, so two specs that differ only in the
/// order of their TOML tables hash identically.
pub fn compute_spec_id(spec: &Spec) -> Result<SpecIdentity, serde_json::Error> {
    let canonical = serde_json::to_vec(spec)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"kiln-spec:");
    hasher.update(&canonical);

    let hex = hasher.finalize().to_hex().to_string();
    let short_id = ShortId::new(&hex[..12]);
    Ok(SpecIdentity {
        spec_id: SpecId::new(hex),
        short_id,
    })
}
