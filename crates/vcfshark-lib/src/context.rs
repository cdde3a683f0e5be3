//! Associative map from 64-bit context words to adaptive coder models.
//! Models are created on first use and accumulate statistics for as long
//! as the map lives; both coding directions must consult contexts in the
//! same order for the bitstreams to agree.

use rustc_hash::FxHashMap;

use crate::rangecoder::SimpleModel;

#[derive(Debug, Default)]
pub struct ContextMap {
    models: FxHashMap<u64, SimpleModel>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the model for `ctx`, constructing it with the given alphabet
    /// and aging cap on first use.
    #[inline]
    pub fn find(&mut self, ctx: u64, n_symbols: usize, max_log_counter: u32) -> &mut SimpleModel {
        self.models
            .entry(ctx)
            .or_insert_with(|| SimpleModel::new(n_symbols, max_log_counter))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteStream;
    use crate::rangecoder::{RangeDecoder, RangeEncoder};

    #[test]
    fn state_accumulates_per_context() {
        let mut map = ContextMap::new();
        let syms = [0usize, 1, 1, 0, 1, 1, 1, 0];
        let mut enc = RangeEncoder::new();
        for (i, &s) in syms.iter().enumerate() {
            let ctx = (i % 2) as u64;
            map.find(ctx, 2, 10).encode(&mut enc, s);
        }
        assert_eq!(map.len(), 2);
        let bytes = enc.finish();

        let mut map = ContextMap::new();
        let mut dec = RangeDecoder::new(ByteStream::from_vec(bytes));
        for (i, &expected) in syms.iter().enumerate() {
            let ctx = (i % 2) as u64;
            assert_eq!(map.find(ctx, 2, 10).decode(&mut dec), expected);
        }
    }
}
