use std::collections::BTreeMap;

use crate::BranchId;
use crate::SeqId;
use crate::sample::sample::Sample;

/// pending `(branch, query)` computations, bucketed by branch:
/// `work[branch_id] = [seq_id, ...]`. drives the branch-parallel kernels
/// and carries selected candidates from pre-scoring into thorough
/// placement.
#[derive(Debug, Clone, Default)]
pub struct Work {
    work_set: BTreeMap<BranchId, Vec<SeqId>>,
}

impl Work {
    pub fn new() -> Self {
        Self::default()
    }

    /// every sequence in `[0, num_sequences)` on every branch in
    /// `[0, num_branches)`
    pub fn all(num_branches: usize, num_sequences: usize) -> Self {
        let mut work = Self::new();
        for branch_id in 0..num_branches {
            work.work_set
                .insert(branch_id, (0..num_sequences).collect());
        }
        work
    }

    pub fn add(&mut self, branch_id: BranchId, seq_id: SeqId) {
        self.work_set.entry(branch_id).or_default().push(seq_id);
    }

    pub fn size(&self) -> usize {
        self.work_set.values().map(|v| v.len()).sum()
    }

    pub fn branches(&self) -> usize {
        self.work_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.work_set.is_empty()
    }

    pub fn clear(&mut self) {
        self.work_set.clear();
    }

    pub fn at(&self, branch_id: BranchId) -> &[SeqId] {
        self.work_set
            .get(&branch_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains_branch(&self, branch_id: BranchId) -> bool {
        self.work_set.contains_key(&branch_id)
    }

    /// iterate branch buckets in branch order
    pub fn bins(&self) -> impl Iterator<Item = (BranchId, &[SeqId])> {
        self.work_set.iter().map(|(&b, v)| (b, v.as_slice()))
    }

    /// iterate flattened, pair by pair, branch-major
    pub fn iter(&self) -> impl Iterator<Item = (BranchId, SeqId)> + '_ {
        self.work_set
            .iter()
            .flat_map(|(&b, v)| v.iter().map(move |&s| (b, s)))
    }
}

/// all placements of a sample become work to be recomputed
impl From<&Sample> for Work {
    fn from(sample: &Sample) -> Self {
        let mut work = Work::new();
        for pq in sample {
            for placement in pq {
                work.add(placement.branch_id(), pq.sequence_id());
            }
        }
        work
    }
}

/// deal the flattened pairs into `num_parts` consecutive chunks. parts may
/// be empty, which is what enables null messages per rank.
pub fn split(src: &Work, num_parts: usize) -> Vec<Work> {
    let mut parts = vec![Work::new(); num_parts];
    if src.size() == 0 {
        return parts;
    }
    let ext_size = (src.size() - (src.size() % num_parts)) + num_parts;
    let chunk_size = ext_size / num_parts;

    let mut i = 0;
    let mut bucket = 0;
    for (branch_id, seq_id) in src.iter() {
        parts[bucket].add(branch_id, seq_id);
        i += 1;
        if i % chunk_size == 0 {
            bucket += 1;
        }
    }
    parts
}

pub fn merge(dest: &mut Work, src: &Work) {
    for (branch_id, seq_id) in src.iter() {
        dest.add(branch_id, seq_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_the_cross_product() {
        let work = Work::all(5, 3);
        assert_eq!(work.size(), 15);
        assert_eq!(work.branches(), 5);
        assert_eq!(work.at(4), &[0, 1, 2]);
    }

    #[test]
    fn iteration_is_branch_major() {
        let mut work = Work::new();
        work.add(2, 7);
        work.add(0, 3);
        work.add(2, 8);
        let pairs: Vec<_> = work.iter().collect();
        assert_eq!(pairs, vec![(0, 3), (2, 7), (2, 8)]);
    }

    #[test]
    fn split_partitions_without_loss_or_overlap() {
        let work = Work::all(4, 7);
        let parts = split(&work, 3);
        assert_eq!(parts.len(), 3);

        let mut merged = Work::new();
        for part in &parts {
            merge(&mut merged, part);
        }
        assert_eq!(merged.size(), work.size());

        let mut all: Vec<_> = merged.iter().collect();
        let mut expect: Vec<_> = work.iter().collect();
        all.sort();
        expect.sort();
        assert_eq!(all, expect);
    }

    #[test]
    fn split_always_yields_requested_parts() {
        let mut work = Work::new();
        work.add(0, 0);
        let parts = split(&work, 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts.iter().map(Work::size).sum::<usize>(), 1);
    }
}
