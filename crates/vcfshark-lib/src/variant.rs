//! Data model shared between the engine and its VCF/BCF parser collaborator.

/// Sentinel for a missing element inside an integer vector. Matches the
/// BCF missing-value bit pattern so parsers can pass values through.
pub const INT_MISSING: i32 = i32::MIN;

/// The six fixed per-variant database columns.
///
/// Fields are stored as `Vec<u8>` rather than `String` because the content
/// is ASCII and must round-trip bit-for-bit without UTF-8 validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDesc {
    pub chrom: Vec<u8>,
    pub pos: i64,
    pub id: Vec<u8>,
    pub ref_allele: Vec<u8>,
    pub alt: Vec<u8>,
    pub qual: Vec<u8>,
}

/// One record of a declared key for one variant.
///
/// `Empty` (key absent for this variant) is distinct from a present record
/// with zero elements, which in turn is distinct from element-level
/// missingness (`INT_MISSING` inside an `Int` vector, or whatever symbol
/// the caller uses for missing genotypes).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Key absent for this variant.
    Empty,
    /// Flag key present.
    Flag,
    /// Integer vector; elements may be `INT_MISSING`.
    Int(Vec<i32>),
    /// Real vector; IEEE bits are preserved exactly.
    Real(Vec<f32>),
    /// Text payload; may be empty while still present.
    Text(Vec<u8>),
    /// One genotype row of `ploidy * samples` symbols. Symbol values are
    /// caller-coded (e.g. htslib-style `(allele + 1) << 1 | phase`, 0 for
    /// missing); the codec treats them as opaque small integers.
    Genotype(Vec<u32>),
}

impl FieldValue {
    /// Number of elements this record contributes, for sizes-stream coding.
    pub fn element_count(&self) -> usize {
        match self {
            FieldValue::Empty | FieldValue::Flag => 0,
            FieldValue::Int(v) => v.len(),
            FieldValue::Real(v) => v.len(),
            FieldValue::Text(v) => v.len(),
            FieldValue::Genotype(v) => v.len(),
        }
    }
}

/// Semantic type of a declared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Flag,
    Int,
    Real,
    Text,
    Genotype,
}

impl KeyKind {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            KeyKind::Flag => 0,
            KeyKind::Int => 1,
            KeyKind::Real => 2,
            KeyKind::Text => 3,
            KeyKind::Genotype => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> anyhow::Result<Self> {
        Ok(match code {
            0 => KeyKind::Flag,
            1 => KeyKind::Int,
            2 => KeyKind::Real,
            3 => KeyKind::Text,
            4 => KeyKind::Genotype,
            _ => anyhow::bail!("invalid key kind code: {code}"),
        })
    }
}

/// Vector dimensionality of a declared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDim {
    Scalar,
    Fixed(u32),
    Variable,
}

/// Descriptor of one user-declared INFO/FORMAT field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDesc {
    /// Stable numeric id; also indexes the engine's per-key tables.
    pub id: u32,
    pub name: Vec<u8>,
    pub kind: KeyKind,
    pub dim: KeyDim,
    /// Set at close when the key's distinct-record count stayed at or
    /// below the configured neglect limit.
    pub neglect: bool,
}

impl KeyDesc {
    pub fn new(id: u32, name: impl Into<Vec<u8>>, kind: KeyKind, dim: KeyDim) -> Self {
        Self { id, name: name.into(), kind, dim, neglect: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_counts() {
        assert_eq!(FieldValue::Empty.element_count(), 0);
        assert_eq!(FieldValue::Flag.element_count(), 0);
        assert_eq!(FieldValue::Int(vec![1, 2, INT_MISSING]).element_count(), 3);
        assert_eq!(FieldValue::Text(b"pass".to_vec()).element_count(), 4);
    }

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [KeyKind::Flag, KeyKind::Int, KeyKind::Real, KeyKind::Text, KeyKind::Genotype] {
            assert_eq!(KeyKind::from_code(kind.to_code()).unwrap(), kind);
        }
        assert!(KeyKind::from_code(9).is_err());
    }
}
