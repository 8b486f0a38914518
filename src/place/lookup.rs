use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use rayon::prelude::*;

use crate::BranchId;
use crate::engine::alphabet::CharMap;
use crate::engine::get_valid_range;
use crate::error::Error;
use crate::error::Result;
use crate::io::msa::Sequence;
use crate::place::buffer::BranchBuffer;
use crate::sample::placement::Placement;
use crate::tree::reference::ReferenceTree;
use crate::tree::tiny::TinyTree;

/// per-branch, per-site, per-character log-likelihood matrix answering
/// pre-scoring queries with one pass over a sequence. character columns
/// are the canonical alphabet classes; one mutex per branch serializes
/// initialization while reads stay lock-free.
pub struct LookupStore {
    store: Vec<OnceLock<Vec<f64>>>,
    init_locks: Vec<Mutex<()>>,
    char_map: CharMap,
    sites: usize,
}

impl LookupStore {
    pub fn new(num_branches: usize, num_states: usize, sites: usize) -> Self {
        Self {
            store: (0..num_branches).map(|_| OnceLock::new()).collect(),
            init_locks: (0..num_branches).map(|_| Mutex::new(())).collect(),
            char_map: CharMap::new(num_states),
            sites,
        }
    }

    pub fn num_branches(&self) -> usize {
        self.store.len()
    }

    pub fn char_map_size(&self) -> usize {
        self.char_map.size()
    }

    pub fn has_branch(&self, branch_id: BranchId) -> bool {
        self.store[branch_id].get().is_some()
    }

    /// precompute the per-site log-likelihoods of every alphabet character
    /// on this branch
    pub fn init_branch(&self, tiny_tree: &mut TinyTree) -> Result<()> {
        let branch_id = tiny_tree.branch_id();
        let _guard = self.init_locks[branch_id].lock().expect("branch mutex");
        if self.has_branch(branch_id) {
            return Ok(());
        }

        let size = self.char_map.size();
        let mut matrix = vec![0.0; self.sites * size];
        let mut column = vec![0.0; self.sites];
        for ch in 0..size {
            tiny_tree.get_persite_logl(self.char_map.char_at(ch), &mut column)?;
            for site in 0..self.sites {
                matrix[site * size + ch] = column[site];
            }
        }
        let _ = self.store[branch_id].set(matrix);
        Ok(())
    }

    /// log-likelihood of `seq` on this branch as the sum of precomputed
    /// per-site values. only valid while the branch's tiny tree is at its
    /// canonical branch lengths, which is the preplacement situation.
    pub fn sum_precomputed_sitelk(
        &self,
        branch_id: BranchId,
        seq: &Sequence,
        premasking: bool,
    ) -> Result<f64> {
        let matrix = self.store[branch_id]
            .get()
            .ok_or_else(|| Error::invariant(format!("lookup missing for branch {branch_id}")))?;

        if seq.len() != self.sites {
            return Err(Error::parse(
                seq.header(),
                "query sequence length not same as reference alignment",
            ));
        }

        let mut range = crate::engine::Range::full(self.sites);
        if premasking {
            range = get_valid_range(seq.sequence());
            if range.is_empty() {
                return Err(Error::EmptySequence(seq.header().into()));
            }
        }
        let size = self.char_map.size();
        let mut sum = 0.0;
        for site in range.begin..range.end() {
            let pos = self.char_map.position(seq.sequence()[site])?;
            sum += matrix[site * size + pos];
        }
        Ok(sum)
    }
}

/// the lookup store plus the default branch length parameters every
/// preplacement on a branch reports. creation computes all lookups, in
/// parallel, optionally through the branch buffer when the memory saver
/// regulates CLV residency.
pub struct LookupPlacement {
    lookup: LookupStore,
    pendant_length: Vec<f64>,
    distal_length: Vec<f64>,
}

impl LookupPlacement {
    pub fn new(ref_tree: &Arc<ReferenceTree>, branches: &[usize]) -> Result<Self> {
        let num_branches = ref_tree.nums.branches;
        let (states, sites) = {
            let part = ref_tree.partition();
            (part.states(), part.sites)
        };
        let lookup = LookupStore::new(num_branches, states, sites);
        let mut pendant_length = vec![-1.0; num_branches];
        let mut distal_length = vec![-1.0; num_branches];

        match &ref_tree.memsave {
            None => {
                let lengths: Result<Vec<(f64, f64)>> = (0..num_branches)
                    .into_par_iter()
                    .map(|branch_id| {
                        let mut tiny =
                            TinyTree::new(ref_tree, branches[branch_id], branch_id, false)?;
                        lookup.init_branch(&mut tiny)?;
                        Ok((tiny.pendant_length(), tiny.distal_length()))
                    })
                    .collect();
                for (branch_id, (pendant, distal)) in lengths?.into_iter().enumerate() {
                    pendant_length[branch_id] = pendant;
                    distal_length[branch_id] = distal;
                }
            }
            Some(ms) => {
                // regulated path: blocks of deep-copied tiny trees keep the
                // resident CLV count within the memory budget
                let mut buffer =
                    BranchBuffer::new(ref_tree.clone(), ms.config.concurrent_branches);
                let mut block = Vec::new();
                while buffer.get_next(&mut block)? > 0 {
                    let lengths: Result<Vec<(BranchId, f64, f64)>> = block
                        .par_iter_mut()
                        .map(|tiny| {
                            lookup.init_branch(tiny)?;
                            Ok((tiny.branch_id(), tiny.pendant_length(), tiny.distal_length()))
                        })
                        .collect();
                    for (branch_id, pendant, distal) in lengths? {
                        pendant_length[branch_id] = pendant;
                        distal_length[branch_id] = distal;
                    }
                }
            }
        }

        Ok(Self {
            lookup,
            pendant_length,
            distal_length,
        })
    }

    pub fn num_branches(&self) -> usize {
        self.pendant_length.len()
    }

    /// preplacement of a query on a branch, entirely from the lookup
    pub fn place(
        &self,
        branch_id: BranchId,
        seq: &Sequence,
        premasking: bool,
    ) -> Result<Placement> {
        let logl = self
            .lookup
            .sum_precomputed_sitelk(branch_id, seq, premasking)?;
        Ok(Placement::new(
            branch_id,
            logl,
            self.pendant_length[branch_id],
            self.distal_length[branch_id],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::SubstModel;
    use crate::io::msa::Msa;
    use crate::options::Options;

    fn reference() -> Arc<ReferenceTree> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.nwk");
        std::fs::write(&path, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);").unwrap();
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("A", b"ACGT".to_vec()));
        msa.append(Sequence::new("B", b"ACGA".to_vec()));
        msa.append(Sequence::new("C", b"ACGG".to_vec()));
        msa.append(Sequence::new("D", b"ACGC".to_vec()));
        let model = SubstModel::new("GTR", 4).unwrap();
        let (tree, _) =
            ReferenceTree::from_files(&path, &mut msa, model, &Options::default(), None).unwrap();
        Arc::new(tree)
    }

    #[test]
    fn lookup_preplacement_matches_direct_placement() {
        let ref_tree = reference();
        let branches = ref_tree.branches();
        let lookup = LookupPlacement::new(&ref_tree, &branches).unwrap();
        let options = Options::default();
        let query = Sequence::new("Q", b"ACGT".to_vec());

        for branch_id in 0..ref_tree.nums.branches {
            let from_lookup = lookup.place(branch_id, &query, true).unwrap();
            let mut tiny =
                TinyTree::new(&ref_tree, branches[branch_id], branch_id, false).unwrap();
            let direct = tiny.place(&query, false, &options).unwrap();
            assert!(
                (from_lookup.likelihood() - direct.likelihood()).abs() < 1e-10,
                "branch {branch_id}: {} vs {}",
                from_lookup.likelihood(),
                direct.likelihood()
            );
        }
    }

    #[test]
    fn unknown_characters_fail_the_sum() {
        let ref_tree = reference();
        let branches = ref_tree.branches();
        let lookup = LookupPlacement::new(&ref_tree, &branches).unwrap();
        let query = Sequence::new("Q", b"AC!T".to_vec());
        assert!(matches!(
            lookup.place(0, &query, false),
            Err(Error::InvalidCharacter('!'))
        ));
    }

    #[test]
    fn premasking_ignores_flanking_gaps() {
        let ref_tree = reference();
        let branches = ref_tree.branches();
        let lookup = LookupPlacement::new(&ref_tree, &branches).unwrap();
        let plain = lookup
            .place(0, &Sequence::new("Q", b"-CG-".to_vec()), true)
            .unwrap();
        let masked = lookup
            .place(0, &Sequence::new("Q", b"?CG?".to_vec()), true)
            .unwrap();
        assert!((plain.likelihood() - masked.likelihood()).abs() < 1e-12);
    }
}
