//! Per-target, per-pass sequence of (operation type, offset) pairs
//! (spec.md §4.4, C4).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The operation an entry in the seek list describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read,
    Write,
    NoOp,
}

/// One entry of the seek list: what to do, and where.
#[derive(Debug, Clone, Copy)]
pub struct SeekEntry {
    pub op_type: OpType,
    pub block_location: u64,
    /// Optional timestamp target (seconds from pass start) driving
    /// throttling (spec.md §4.7).
    pub target_time: Option<f64>,
}

/// How successive entries' offsets are generated.
#[derive(Debug, Clone)]
pub enum AccessPattern {
    /// Monotonically increasing offsets.
    Sequential,
    /// PRNG-driven, reproducible from `seed`.
    Random { seed: u64 },
    /// Loaded from an externally-provided list of block numbers (e.g.
    /// read from a staged file by a collaborator outside `xdd-core`).
    Staged { block_numbers: Vec<u64> },
}

/// A finite, immutable-per-pass list of `(op_type, block_location)`
/// tuples for one target.
#[derive(Debug, Clone)]
pub struct SeekList {
    entries: Vec<SeekEntry>,
}

impl SeekList {
    /// Build a seek list of `total_ops` entries. `rwratio` is the
    /// fraction of read operations in `[0.0, 1.0]`; `block_size` and
    /// `xfer_size` (in blocks, i.e. `xfer_size / block_size` blocks per
    /// op) determine sequential spacing.
    pub fn generate(
        total_ops: u64,
        rwratio: f64,
        blocks_per_op: u64,
        pattern: &AccessPattern,
    ) -> Self {
        assert!((0.0..=1.0).contains(&rwratio), "rwratio must be in [0.0, 1.0]");
        let op_types = Self::op_type_sequence(total_ops, rwratio);
        let locations = Self::locations(total_ops, blocks_per_op, pattern);
        let entries = op_types
            .into_iter()
            .zip(locations)
            .map(|(op_type, block_location)| SeekEntry { op_type, block_location, target_time: None })
            .collect();
        Self { entries }
    }

    /// Deterministically interleave read/write ops so that over any
    /// prefix the read fraction tracks `rwratio` to within one operation
    /// (spec.md §8 scenario 2: `|read_op_count - total/2| <= 1` for
    /// `rwratio = 0.5`).
    fn op_type_sequence(total_ops: u64, rwratio: f64) -> Vec<OpType> {
        if rwratio <= 0.0 {
            return vec![OpType::Write; total_ops as usize];
        }
        if rwratio >= 1.0 {
            return vec![OpType::Read; total_ops as usize];
        }
        let mut out = Vec::with_capacity(total_ops as usize);
        let mut reads_issued = 0u64;
        for i in 1..=total_ops {
            let target_reads = (i as f64 * rwratio).round() as u64;
            if target_reads > reads_issued {
                out.push(OpType::Read);
                reads_issued += 1;
            } else {
                out.push(OpType::Write);
            }
        }
        out
    }

    fn locations(total_ops: u64, blocks_per_op: u64, pattern: &AccessPattern) -> Vec<u64> {
        match pattern {
            AccessPattern::Sequential => {
                (0..total_ops).map(|i| i * blocks_per_op).collect()
            }
            AccessPattern::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                // Reproducible from the seed: same seed, same sequence.
                let max_block = total_ops.saturating_mul(blocks_per_op).max(blocks_per_op);
                (0..total_ops).map(|_| rng.gen_range(0..max_block)).collect()
            }
            AccessPattern::Staged { block_numbers } => {
                assert!(
                    block_numbers.len() as u64 >= total_ops,
                    "staged pattern must supply at least total_ops block numbers"
                );
                block_numbers[..total_ops as usize].to_vec()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, op_number: u64) -> Option<&SeekEntry> {
        self.entries.get(op_number as usize)
    }

    /// Shift every entry's block location by `pass_offset` blocks, used
    /// across passes per spec.md §4.4 ("the supervisor may shift all
    /// positions by `pass_offset`").
    pub fn shifted(&self, pass_offset: i64, pass_number: u64) -> SeekList {
        let shift = pass_offset.saturating_mul(pass_number as i64);
        let entries = self
            .entries
            .iter()
            .map(|e| SeekEntry {
                block_location: (e.block_location as i64 + shift).max(0) as u64,
                ..*e
            })
            .collect();
        SeekList { entries }
    }

    pub fn read_op_count(&self) -> usize {
        self.entries.iter().filter(|e| e.op_type == OpType::Read).count()
    }

    pub fn write_op_count(&self) -> usize {
        self.entries.iter().filter(|e| e.op_type == OpType::Write).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_pattern_is_monotonic() {
        let list = SeekList::generate(8, 0.0, 2, &AccessPattern::Sequential);
        let locations: Vec<u64> = (0..8).map(|i| list.get(i).unwrap().block_location).collect();
        assert_eq!(locations, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn pure_write_ratio_is_all_writes() {
        let list = SeekList::generate(16, 0.0, 1, &AccessPattern::Sequential);
        assert_eq!(list.read_op_count(), 0);
        assert_eq!(list.write_op_count(), 16);
    }

    #[test]
    fn pure_read_ratio_is_all_reads() {
        let list = SeekList::generate(16, 1.0, 1, &AccessPattern::Sequential);
        assert_eq!(list.read_op_count(), 16);
        assert_eq!(list.write_op_count(), 0);
    }

    #[test]
    fn mixed_ratio_stays_within_one_of_target() {
        let list = SeekList::generate(1024, 0.5, 1, &AccessPattern::Sequential);
        assert_eq!(list.read_op_count() + list.write_op_count(), 1024);
        let diff = (list.read_op_count() as i64 - 512).abs();
        assert!(diff <= 1, "read count {} too far from 512", list.read_op_count());
    }

    #[test]
    fn random_pattern_is_reproducible_from_seed() {
        let a = SeekList::generate(32, 0.5, 1, &AccessPattern::Random { seed: 42 });
        let b = SeekList::generate(32, 0.5, 1, &AccessPattern::Random { seed: 42 });
        let locs_a: Vec<u64> = (0..32).map(|i| a.get(i).unwrap().block_location).collect();
        let locs_b: Vec<u64> = (0..32).map(|i| b.get(i).unwrap().block_location).collect();
        assert_eq!(locs_a, locs_b);
    }

    #[test]
    fn shifted_moves_every_entry() {
        let list = SeekList::generate(4, 0.0, 1, &AccessPattern::Sequential);
        let shifted = list.shifted(100, 2);
        assert_eq!(shifted.get(0).unwrap().block_location, 200);
        assert_eq!(shifted.get(1).unwrap().block_location, 201);
    }

    #[test]
    fn staged_pattern_uses_supplied_blocks() {
        let blocks = vec![5, 1, 9, 3];
        let list = SeekList::generate(4, 0.0, 1, &AccessPattern::Staged { block_numbers: blocks.clone() });
        for i in 0..4 {
            assert_eq!(list.get(i).unwrap().block_location, blocks[i as usize]);
        }
    }
}
