use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;
use crate::io::msa::Msa;
use crate::io::msa::MsaInfo;
use crate::io::msa::Sequence;
use crate::io::msa::update_gap_mask;

/// streaming text-FASTA reader. sequences come out uppercased; zero-length
/// entries are skipped silently. byte offsets of the headers are indexed
/// on demand for rank sharding.
pub struct FastaReader {
    path: PathBuf,
    reader: BufReader<std::fs::File>,
    offsets: Vec<u64>,
    num_sequences: Option<usize>,
    max_read: usize,
    num_read: usize,
}

impl FastaReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offsets: Vec::new(),
            num_sequences: None,
            max_read: usize::MAX,
            num_read: 0,
        })
    }

    /// cap how many sequences this reader hands out in total
    pub fn constrain(&mut self, max_read: usize) {
        self.max_read = max_read;
    }

    /// reposition to the n-th sequence of the file
    pub fn skip_to_sequence(&mut self, n: usize) -> Result<()> {
        let total = self.num_sequences()?;
        if n >= total {
            return Err(Error::parse(
                self.path.to_string_lossy(),
                "trying to skip out of bounds",
            ));
        }
        let offset = self.offsets[n];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.num_read = 0;
        Ok(())
    }

    /// total number of sequences, indexing header offsets on first use
    pub fn num_sequences(&mut self) -> Result<usize> {
        if let Some(n) = self.num_sequences {
            return Ok(n);
        }
        let mut scan = BufReader::new(std::fs::File::open(&self.path)?);
        let mut offsets = Vec::new();
        let mut pos: u64 = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = scan.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            if line.first() == Some(&b'>') {
                offsets.push(pos);
            }
            pos += read as u64;
        }
        self.offsets = offsets;
        self.num_sequences = Some(self.offsets.len());
        Ok(self.offsets.len())
    }

    /// append up to `number` sequences to `out`, returning how many were
    /// read. stops silently at EOF.
    pub fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        out.clear();
        let mut left = number.min(self.max_read.saturating_sub(self.num_read));
        let mut header: Option<String> = None;
        let mut sequence: Vec<u8> = Vec::new();
        let mut line = Vec::new();

        while left > 0 {
            let start = self.reader.stream_position()?;
            line.clear();
            let read = self.reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                // EOF: flush the last record
                if let Some(h) = header.take() {
                    if !sequence.is_empty() {
                        push_record(out, h, std::mem::take(&mut sequence))?;
                        left -= 1;
                        self.num_read += 1;
                    }
                }
                break;
            }
            let trimmed = trim_line(&line);
            if trimmed.first() == Some(&b'>') {
                if let Some(h) = header.take() {
                    if sequence.is_empty() {
                        // skip zero-length sequences
                        header = Some(parse_header(trimmed));
                        continue;
                    }
                    push_record(out, h, std::mem::take(&mut sequence))?;
                    left -= 1;
                    self.num_read += 1;
                    if left == 0 {
                        // unread the header we just consumed
                        self.reader.seek(SeekFrom::Start(start))?;
                        break;
                    }
                }
                header = Some(parse_header(trimmed));
            } else if header.is_some() {
                sequence.extend(trimmed.iter().map(|c| c.to_ascii_uppercase()));
            }
        }
        Ok(out.size())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn parse_header(line: &[u8]) -> String {
    String::from_utf8_lossy(&line[1..]).trim().to_string()
}

fn push_record(out: &mut Msa, header: String, sequence: Vec<u8>) -> Result<()> {
    if out.num_sites() != 0 && out.num_sites() != sequence.len() {
        return Err(Error::parse(
            &header,
            "MSA file does not contain equal size sequences",
        ));
    }
    out.append(Sequence::new(header, sequence));
    Ok(())
}

/// read a whole alignment file into memory: fasta, or sequential phylip
/// when the first line is a counts header
pub fn build_msa_from_file(path: &Path) -> Result<Msa> {
    let mut probe = [0u8; 1];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut probe)?;
    if n == 0 {
        return Err(Error::parse(path.to_string_lossy(), "empty alignment file"));
    }
    if probe[0] == b'>' {
        let mut reader = FastaReader::open(path)?;
        let mut msa = Msa::default();
        reader.read_next(&mut msa, usize::MAX)?;
        Ok(msa)
    } else {
        read_phylip(path)
    }
}

/// shape summary of an alignment file, including the all-gap column mask
pub fn msa_info_from_file(path: &Path) -> Result<MsaInfo> {
    let mut reader = FastaReader::open(path)?;
    let mut sequences = 0;
    let mut sites = 0;
    let mut gap_mask: Vec<bool> = Vec::new();
    let mut chunk = Msa::default();
    while reader.read_next(&mut chunk, 1024)? > 0 {
        for seq in &chunk {
            if gap_mask.is_empty() {
                sites = seq.len();
                gap_mask = vec![true; sites];
            }
            update_gap_mask(&mut gap_mask, seq.sequence());
            sequences += 1;
        }
    }
    Ok(MsaInfo::new(sequences, sites, gap_mask))
}

/// minimal sequential phylip: a counts line, then one record per line
fn read_phylip(path: &Path) -> Result<Msa> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::parse(path.to_string_lossy(), "empty phylip file"))?;
    let mut parts = header.split_whitespace();
    let count: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::parse(path.to_string_lossy(), "malformed phylip header"))?;
    let sites: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::parse(path.to_string_lossy(), "malformed phylip header"))?;

    let mut msa = Msa::new(sites);
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut split = line.split_whitespace();
        let name = split
            .next()
            .ok_or_else(|| Error::parse(path.to_string_lossy(), "malformed phylip record"))?;
        let seq: String = split.collect();
        if seq.len() != sites {
            return Err(Error::parse(
                path.to_string_lossy(),
                format!("phylip record '{name}' has wrong length"),
            ));
        }
        msa.append(Sequence::new(name, seq.to_ascii_uppercase().into_bytes()));
    }
    if msa.size() != count {
        return Err(Error::parse(
            path.to_string_lossy(),
            "phylip sequence count mismatch",
        ));
    }
    Ok(msa)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fasta_file(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fasta");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_chunks_and_uppercases() {
        let (_dir, path) = fasta_file(">q1\nacgt\n>q2\nACGA\n>q3\nacga\n");
        let mut reader = FastaReader::open(&path).unwrap();
        let mut msa = Msa::default();
        assert_eq!(reader.read_next(&mut msa, 2).unwrap(), 2);
        assert_eq!(msa.get(0).sequence(), b"ACGT");
        assert_eq!(msa.get(1).header(), "q2");
        assert_eq!(reader.read_next(&mut msa, 2).unwrap(), 1);
        assert_eq!(msa.get(0).header(), "q3");
        assert_eq!(reader.read_next(&mut msa, 2).unwrap(), 0);
    }

    #[test]
    fn multiline_sequences_are_joined() {
        let (_dir, path) = fasta_file(">q1\nAC\nGT\n>q2\nAC\nGA\n");
        let mut reader = FastaReader::open(&path).unwrap();
        let mut msa = Msa::default();
        assert_eq!(reader.read_next(&mut msa, 10).unwrap(), 2);
        assert_eq!(msa.get(0).sequence(), b"ACGT");
        assert_eq!(msa.get(1).sequence(), b"ACGA");
    }

    #[test]
    fn skip_and_constrain_shard_the_file() {
        let (_dir, path) = fasta_file(">q0\nAAAA\n>q1\nCCCC\n>q2\nGGGG\n>q3\nTTTT\n");
        let mut reader = FastaReader::open(&path).unwrap();
        assert_eq!(reader.num_sequences().unwrap(), 4);
        reader.skip_to_sequence(2).unwrap();
        reader.constrain(2);
        let mut msa = Msa::default();
        assert_eq!(reader.read_next(&mut msa, 10).unwrap(), 2);
        assert_eq!(msa.get(0).header(), "q2");
        assert_eq!(msa.get(1).header(), "q3");
    }

    #[test]
    fn empty_records_are_skipped() {
        let (_dir, path) = fasta_file(">empty\n>q1\nACGT\n");
        let mut reader = FastaReader::open(&path).unwrap();
        let mut msa = Msa::default();
        assert_eq!(reader.read_next(&mut msa, 10).unwrap(), 1);
        assert_eq!(msa.get(0).header(), "q1");
    }

    #[test]
    fn phylip_alignments_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.phy");
        std::fs::write(&path, "2 4\nA ACGT\nB acga\n").unwrap();
        let msa = build_msa_from_file(&path).unwrap();
        assert_eq!(msa.size(), 2);
        assert_eq!(msa.get(1).sequence(), b"ACGA");
    }

    #[test]
    fn info_reports_gap_mask() {
        let (_dir, path) = fasta_file(">q1\n-CGT\n>q2\n-CGA\n");
        let info = msa_info_from_file(&path).unwrap();
        assert_eq!(info.sequences, 2);
        assert_eq!(info.sites, 4);
        assert_eq!(info.gap_mask, vec![true, false, false, false]);
    }
}
