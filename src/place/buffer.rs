use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::place::work::Work;
use crate::tree::reference::ReferenceTree;
use crate::tree::tiny::TinyTree;

/// asynchronous producer of blocks of ready-to-use tiny trees under the
/// memory saver. walks the largest-subtree-first branch traversal, makes
/// the endpoint CLVs resident, and hands out deep-copied tiny trees so a
/// block stays valid after the underlying CLVs are evicted again.
pub struct BranchBuffer {
    tree: Arc<ReferenceTree>,
    block_size: usize,
    /// branches not in the whitelist are skipped; empty means all
    whitelist: Arc<Vec<bool>>,
    cursor: usize,
    prefetcher: Option<JoinHandle<Result<(Vec<TinyTree>, usize)>>>,
}

impl BranchBuffer {
    pub fn new(tree: Arc<ReferenceTree>, block_size: usize) -> Self {
        Self::with_whitelist(tree, block_size, &Work::new())
    }

    /// whitelisted variant: only treat branches that occur in the work
    pub fn with_whitelist(tree: Arc<ReferenceTree>, block_size: usize, work: &Work) -> Self {
        let whitelist = if work.is_empty() {
            Vec::new()
        } else {
            let mut list = vec![false; tree.nums.branches];
            for (branch_id, _) in work.bins() {
                list[branch_id] = true;
            }
            list
        };
        let mut this = Self {
            tree,
            block_size,
            whitelist: Arc::new(whitelist),
            cursor: 0,
            prefetcher: None,
        };
        this.launch();
        this
    }

    fn launch(&mut self) {
        let tree = self.tree.clone();
        let whitelist = self.whitelist.clone();
        let block_size = self.block_size;
        let cursor = self.cursor;
        self.prefetcher = Some(std::thread::spawn(move || {
            calc_block(&tree, block_size, cursor, &whitelist)
        }));
    }

    /// swap out the prefetched block and immediately start computing the
    /// next one. a return of 0 signals the traversal is exhausted.
    pub fn get_next(&mut self, out: &mut Vec<TinyTree>) -> Result<usize> {
        let handle = self.prefetcher.take().expect("one outstanding prefetch");
        let (block, cursor) = handle.join().expect("prefetch thread panicked")?;
        self.cursor = cursor;
        *out = block;
        self.launch();
        Ok(out.len())
    }
}

impl Drop for BranchBuffer {
    fn drop(&mut self) {
        // avoid dangling threads
        if let Some(handle) = self.prefetcher.take() {
            let _ = handle.join();
        }
    }
}

/// compute the next block of branches along the memory saver traversal.
/// whitelist misses are skipped without consuming block budget.
fn calc_block(
    tree: &ReferenceTree,
    block_size: usize,
    mut cursor: usize,
    whitelist: &[bool],
) -> Result<(Vec<TinyTree>, usize)> {
    let memsave = tree
        .memsave
        .as_ref()
        .expect("branch buffer requires the memory saver");
    let traversal = &memsave.branch_traversal;

    let mut block = Vec::with_capacity(block_size);
    while cursor < traversal.len() && block.len() < block_size {
        let branch_node = traversal[cursor];
        cursor += 1;
        let branch_id = tree.branch_ids[branch_node];
        if !whitelist.is_empty() && !whitelist[branch_id] {
            continue;
        }
        // materializes the endpoint CLVs, then persists them into a
        // dedicated deep copy owned by the tiny tree
        block.push(TinyTree::new(tree, branch_node, branch_id, true)?);
    }
    Ok((block, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::SubstModel;
    use crate::io::msa::Msa;
    use crate::io::msa::Sequence;
    use crate::memory::MemoryConfig;
    use crate::options::Options;

    fn memsave_reference() -> Arc<ReferenceTree> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.nwk");
        std::fs::write(&path, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);").unwrap();
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("A", b"ACGT".to_vec()));
        msa.append(Sequence::new("B", b"ACGA".to_vec()));
        msa.append(Sequence::new("C", b"ACGG".to_vec()));
        msa.append(Sequence::new("D", b"ACGC".to_vec()));
        let model = SubstModel::new("GTR", 4).unwrap();
        let config = MemoryConfig {
            concurrent_branches: 2,
            preplace_lookup_enabled: true,
            clv_slots: 6,
        };
        let (tree, _) = ReferenceTree::from_files(
            &path,
            &mut msa,
            model,
            &Options::default(),
            Some(config),
        )
        .unwrap();
        Arc::new(tree)
    }

    #[test]
    fn blocks_cover_every_branch_exactly_once() {
        let reference = memsave_reference();
        let mut buffer = BranchBuffer::new(reference.clone(), 2);
        let mut seen = vec![0usize; reference.nums.branches];
        let mut block = Vec::new();
        while buffer.get_next(&mut block).unwrap() > 0 {
            assert!(block.len() <= 2);
            for tiny in &block {
                seen[tiny.branch_id()] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "{seen:?}");
    }

    #[test]
    fn whitelist_restricts_the_blocks() {
        let reference = memsave_reference();
        let mut work = Work::new();
        work.add(1, 0);
        work.add(3, 0);
        let mut buffer = BranchBuffer::with_whitelist(reference, 4, &work);
        let mut branches = Vec::new();
        let mut block = Vec::new();
        while buffer.get_next(&mut block).unwrap() > 0 {
            branches.extend(block.iter().map(|t| t.branch_id()));
        }
        branches.sort();
        assert_eq!(branches, vec![1, 3]);
    }
}
