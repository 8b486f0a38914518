use std::path::Path;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::io::bfast;
use crate::io::bfast::BfastReader;
use crate::io::fasta::FastaReader;
use crate::io::msa::Msa;

/// chunked reader over a query file, text fasta or 4-bit fasta alike
pub trait MsaReader: Send {
    fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize>;
    fn num_sequences(&mut self) -> Result<usize>;
    /// global index of the first sequence this reader hands out
    fn local_seq_offset(&self) -> usize;
}

struct FastaStream {
    inner: FastaReader,
    local_seq_offset: usize,
}

impl MsaReader for FastaStream {
    fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        self.inner.read_next(out, number)
    }

    fn num_sequences(&mut self) -> Result<usize> {
        self.inner.num_sequences()
    }

    fn local_seq_offset(&self) -> usize {
        self.local_seq_offset
    }
}

struct BfastStream {
    inner: BfastReader,
    local_seq_offset: usize,
}

impl MsaReader for BfastStream {
    fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        self.inner.read_next(out, number)
    }

    fn num_sequences(&mut self) -> Result<usize> {
        Ok(self.inner.num_sequences())
    }

    fn local_seq_offset(&self) -> usize {
        self.local_seq_offset
    }
}

/// `(offset, cap)` of this rank's contiguous shard of `total` sequences.
/// empty shards are allowed so every rank still produces a null part.
fn local_seq_package(total: usize, num_ranks: usize, rank: usize) -> (usize, usize) {
    let part_size = total.div_ceil(num_ranks);
    let offset = part_size * rank;
    if offset >= total {
        (0, 0)
    } else {
        (offset, part_size)
    }
}

/// open a query stream, probing the format by magic. under multi-rank
/// execution each rank seeks to its shard and caps its read accordingly.
pub fn make_msa_reader(
    path: &Path,
    premasking: bool,
    prefetch: bool,
    num_ranks: usize,
    rank: usize,
) -> Result<Box<dyn MsaReader>> {
    let reader: Box<dyn MsaReader> = if bfast::is_bfast(path) {
        let mut inner = BfastReader::open(path, premasking)?;
        let mut local_seq_offset = 0;
        if num_ranks > 1 {
            let (offset, cap) = local_seq_package(inner.num_sequences(), num_ranks, rank);
            log::info!("number of sequences per rank: {cap}");
            if cap > 0 {
                inner.skip_to_sequence(offset)?;
                local_seq_offset = offset;
            }
            inner.constrain(cap);
        }
        Box::new(BfastStream {
            inner,
            local_seq_offset,
        })
    } else {
        let mut inner = FastaReader::open(path)?;
        let mut local_seq_offset = 0;
        if num_ranks > 1 {
            let (offset, cap) = local_seq_package(inner.num_sequences()?, num_ranks, rank);
            log::info!("number of sequences per rank: {cap}");
            if cap > 0 {
                inner.skip_to_sequence(offset)?;
                local_seq_offset = offset;
            }
            inner.constrain(cap);
        }
        Box::new(FastaStream {
            inner,
            local_seq_offset,
        })
    };

    Ok(if prefetch {
        Box::new(Prefetcher::new(reader)?)
    } else {
        reader
    })
}

/// reader over sequences already in memory, e.g. queries split off a
/// combined reference MSA
pub struct InMemoryReader {
    sequences: std::vec::IntoIter<crate::io::msa::Sequence>,
    total: usize,
    sites: usize,
}

impl InMemoryReader {
    pub fn new(msa: Msa) -> Self {
        let total = msa.size();
        let sites = msa.num_sites();
        Self {
            sequences: msa.take().into_iter(),
            total,
            sites,
        }
    }
}

impl MsaReader for InMemoryReader {
    fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        *out = Msa::new(self.sites);
        for seq in self.sequences.by_ref().take(number) {
            out.append(seq);
        }
        Ok(out.size())
    }

    fn num_sequences(&mut self) -> Result<usize> {
        Ok(self.total)
    }

    fn local_seq_offset(&self) -> usize {
        0
    }
}

/// single-outstanding-prefetch decorator: while the caller works on the
/// current chunk, a worker already reads the next one. destruction waits
/// on the in-flight read.
pub struct Prefetcher {
    state: Option<State>,
    num_sequences: usize,
    local_seq_offset: usize,
}

enum State {
    Ready(Box<dyn MsaReader>),
    Pending(JoinHandle<(Box<dyn MsaReader>, Result<Msa>)>),
}

impl Prefetcher {
    pub fn new(mut inner: Box<dyn MsaReader>) -> Result<Self> {
        let num_sequences = inner.num_sequences()?;
        let local_seq_offset = inner.local_seq_offset();
        Ok(Self {
            state: Some(State::Ready(inner)),
            num_sequences,
            local_seq_offset,
        })
    }

    fn launch(&mut self, mut reader: Box<dyn MsaReader>, number: usize) {
        self.state = Some(State::Pending(std::thread::spawn(move || {
            let mut chunk = Msa::default();
            let result = reader.read_next(&mut chunk, number).map(|_| chunk);
            (reader, result)
        })));
    }
}

impl MsaReader for Prefetcher {
    fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        let (reader, chunk) = match self.state.take().expect("prefetcher state") {
            State::Pending(handle) => {
                let (reader, result) = handle.join().expect("prefetch thread panicked");
                (reader, result?)
            }
            State::Ready(mut reader) => {
                let mut chunk = Msa::default();
                reader.read_next(&mut chunk, number)?;
                (reader, chunk)
            }
        };
        *out = chunk;
        self.launch(reader, number);
        Ok(out.size())
    }

    fn num_sequences(&mut self) -> Result<usize> {
        Ok(self.num_sequences)
    }

    fn local_seq_offset(&self) -> usize {
        self.local_seq_offset
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // avoid dangling threads
        if let Some(State::Pending(handle)) = self.state.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queries(dir: &tempfile::TempDir, n: usize) -> std::path::PathBuf {
        let path = dir.path().join("queries.fasta");
        let mut content = String::new();
        for i in 0..n {
            content.push_str(&format!(">q{i}\nACGT\n"));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn prefetching_reads_the_same_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = queries(&dir, 7);

        let mut plain = make_msa_reader(&path, false, false, 1, 0).unwrap();
        let mut fetched = make_msa_reader(&path, false, true, 1, 0).unwrap();

        loop {
            let mut a = Msa::default();
            let mut b = Msa::default();
            let na = plain.read_next(&mut a, 3).unwrap();
            let nb = fetched.read_next(&mut b, 3).unwrap();
            assert_eq!(na, nb);
            for i in 0..na {
                assert_eq!(a.get(i).header(), b.get(i).header());
            }
            if na == 0 {
                break;
            }
        }
    }

    #[test]
    fn ranks_partition_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = queries(&dir, 10);

        let mut seen = Vec::new();
        for rank in 0..4 {
            let mut reader = make_msa_reader(&path, false, false, 4, rank).unwrap();
            let offset = reader.local_seq_offset();
            let mut chunk = Msa::default();
            while reader.read_next(&mut chunk, 3).unwrap() > 0 {
                for seq in &chunk {
                    seen.push((rank, offset, seq.header().to_string()));
                }
            }
        }
        // union of the shards is the whole file, without overlap
        let headers: Vec<String> = seen.iter().map(|(_, _, h)| h.clone()).collect();
        let mut sorted = headers.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);
        // ranks get contiguous, offset-aligned parts
        for (rank, offset, _) in &seen {
            assert_eq!(*offset, rank * 3);
        }
    }
}
