//! Positional prefix permutation over the genotype matrix. At every row
//! the columns are re-emitted in an order that sorts them by their
//! reverse prefix; the permutation update depends only on the previous
//! permutation and the current (already permuted) row, so encoder and
//! decoder evolve in lockstep.

/// Symbols below this bound take the counting-sort fast path.
const SMALL_ALPHABET: u32 = 256;

#[derive(Debug, Default)]
pub struct Pbwt {
    perm: Vec<u32>,
    scratch: Vec<u32>,
    initialised: bool,
}

impl Pbwt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state; the next row re-initialises at its own width.
    pub fn reset(&mut self) {
        self.perm.clear();
        self.scratch.clear();
        self.initialised = false;
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// Width is known only once the first variant arrives.
    fn ensure_width(&mut self, width: usize) {
        if !self.initialised {
            self.perm = (0..width as u32).collect();
            self.scratch = vec![0; width];
            self.initialised = true;
        }
        debug_assert_eq!(self.perm.len(), width);
    }

    /// Emit `row` in permuted order into `out`, then advance the
    /// permutation by the emitted row.
    pub fn forward(&mut self, row: &[u32], out: &mut Vec<u32>) {
        self.ensure_width(row.len());
        out.clear();
        out.extend(self.perm.iter().map(|&j| row[j as usize]));
        self.advance(out);
    }

    /// Reconstruct the original row from its permuted form, then advance
    /// the permutation identically to the forward direction.
    pub fn inverse(&mut self, permuted: &[u32], out: &mut Vec<u32>) {
        self.ensure_width(permuted.len());
        out.clear();
        out.resize(permuted.len(), 0);
        for (k, &j) in self.perm.iter().enumerate() {
            out[j as usize] = permuted[k];
        }
        self.advance(permuted);
    }

    /// Stable partition of the permutation by the current permuted row:
    /// columns with smaller symbols move ahead, ties keep their order.
    fn advance(&mut self, permuted: &[u32]) {
        let width = permuted.len();
        let max_sym = permuted.iter().copied().max().unwrap_or(0);

        if max_sym < SMALL_ALPHABET {
            let n_sym = max_sym as usize + 1;
            let mut counts = vec![0u32; n_sym + 1];
            for &s in permuted {
                counts[s as usize + 1] += 1;
            }
            for i in 0..n_sym {
                counts[i + 1] += counts[i];
            }
            for k in 0..width {
                let s = permuted[k] as usize;
                self.scratch[counts[s] as usize] = self.perm[k];
                counts[s] += 1;
            }
            std::mem::swap(&mut self.perm, &mut self.scratch);
        } else {
            // Rare wide symbols: a stable sort gives the same partition.
            let mut order: Vec<u32> = (0..width as u32).collect();
            order.sort_by_key(|&k| permuted[k as usize]);
            for (dst, &k) in order.iter().enumerate() {
                self.scratch[dst] = self.perm[k as usize];
            }
            std::mem::swap(&mut self.perm, &mut self.scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rows: &[Vec<u32>]) {
        let mut fwd = Pbwt::new();
        let mut inv = Pbwt::new();
        let mut permuted = Vec::new();
        let mut restored = Vec::new();
        for row in rows {
            fwd.forward(row, &mut permuted);
            inv.inverse(&permuted, &mut restored);
            assert_eq!(&restored, row);
        }
    }

    #[test]
    fn identity_on_binary_matrix() {
        let rows: Vec<Vec<u32>> = (0..50)
            .map(|i| (0..20).map(|j| ((i * 7 + j * 13) % 2) as u32).collect())
            .collect();
        roundtrip(&rows);
    }

    #[test]
    fn identity_with_wide_symbols() {
        let rows: Vec<Vec<u32>> = (0..20)
            .map(|i| {
                (0..16)
                    .map(|j| if (i + j) % 5 == 0 { 70_000 + j as u32 } else { (j % 3) as u32 })
                    .collect()
            })
            .collect();
        roundtrip(&rows);
    }

    #[test]
    fn sorts_identical_columns_together() {
        // Two interleaved column groups; after a few rows the permutation
        // clusters each group contiguously.
        let row_a: Vec<u32> = (0..8).map(|j| (j % 2) as u32).collect();
        let mut pbwt = Pbwt::new();
        let mut out = Vec::new();
        for _ in 0..4 {
            pbwt.forward(&row_a, &mut out);
        }
        assert_eq!(out, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn reset_reinitialises_width() {
        let mut pbwt = Pbwt::new();
        let mut out = Vec::new();
        pbwt.forward(&[1, 0, 1], &mut out);
        pbwt.reset();
        assert!(!pbwt.is_initialised());
        pbwt.forward(&[0, 1], &mut out);
        assert_eq!(out.len(), 2);
    }
}
