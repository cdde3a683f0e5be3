//! Engine configuration and the on-disk parameter stream.

use anyhow::Result;

/// Format tag stored at the head of the `params` stream.
const PARAMS_TAG: [u8; 4] = *b"GTS1";

/// Engine options supplied by the caller at archive-open time.
#[derive(Debug, Clone)]
pub struct Params {
    /// Fields whose distinct-record count stays at or below this limit
    /// are marked `neglect` in the stored key table.
    pub neglect_limit: u32,
    /// Worker threads for the write path.
    pub no_threads: u32,
    /// Haplotypes per sample; genotype rows are `ploidy * samples` wide.
    pub ploidy: u32,
    /// Accept non-standard variant records. Parser-side switch; does not
    /// affect archive layout.
    pub extra_variants: bool,
    /// Keep the per-sample header section when emitting VCF.
    pub store_sample_header: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            neglect_limit: 10,
            no_threads: 8,
            ploidy: 2,
            extra_variants: false,
            store_sample_header: false,
        }
    }
}

impl Params {
    /// Serialise the five-byte parameter stream: `G T S 1 <neglect_limit>`.
    pub fn store(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(5);
        v.extend_from_slice(&PARAMS_TAG);
        v.push(self.neglect_limit as u8);
        v
    }

    /// Parse the parameter stream, updating `neglect_limit`.
    pub fn load(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() != 5 {
            anyhow::bail!("params stream has {} bytes, expected 5", raw.len());
        }
        if raw[..4] != PARAMS_TAG {
            anyhow::bail!("params stream tag mismatch");
        }
        self.neglect_limit = raw[4] as u32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_roundtrip() {
        let mut p = Params { neglect_limit: 33, ..Params::default() };
        let raw = p.store();
        assert_eq!(raw.len(), 5);
        p.neglect_limit = 0;
        p.load(&raw).unwrap();
        assert_eq!(p.neglect_limit, 33);
    }

    #[test]
    fn load_rejects_bad_tag() {
        let mut p = Params::default();
        assert!(p.load(b"XTS1\x0a").is_err());
        assert!(p.load(b"GTS1").is_err());
    }
}
