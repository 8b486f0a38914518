use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use byteorder::LE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;

use crate::engine::alphabet::CharMap;
use crate::engine::alphabet::NT_MAP;
use crate::error::Error;
use crate::error::Result;
use crate::io::msa::Msa;
use crate::io::msa::MsaInfo;
use crate::io::msa::Sequence;
use crate::io::msa::subset_sequence;
use crate::io::msa::update_gap_mask;

pub const MAGIC: &[u8; 6] = b"BFAST\0";

/// packs two nucleotide characters per byte. the nibble values index
/// `NT_MAP`, so every canonical character class maps bijectively onto one
/// 4-bit code, and an odd trailing character is padded with the gap code.
pub struct FourBit {
    map: CharMap,
}

impl Default for FourBit {
    fn default() -> Self {
        Self {
            map: CharMap::new(4),
        }
    }
}

impl FourBit {
    pub fn packed_size(&self, len: usize) -> usize {
        len.div_ceil(2)
    }

    fn code(&self, c: u8) -> Result<u8> {
        match self.map.position(c) {
            Ok(pos) => Ok(pos as u8),
            Err(Error::InvalidCharacter(c)) => Err(Error::UnsupportedAlphabet(c)),
            Err(e) => Err(e),
        }
    }

    pub fn encode(&self, seq: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.packed_size(seq.len()));
        let mut chunks = seq.chunks_exact(2);
        for pair in &mut chunks {
            out.push((self.code(pair[0])? << 4) | self.code(pair[1])?);
        }
        if let [last] = chunks.remainder() {
            out.push(self.code(*last)? << 4);
        }
        Ok(out)
    }

    pub fn decode(&self, packed: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for &byte in packed {
            out.push(NT_MAP[(byte >> 4) as usize]);
            if out.len() < len {
                out.push(NT_MAP[(byte & 0x0f) as usize]);
            }
        }
        out.truncate(len);
        out
    }
}

fn put_string(out: &mut impl Write, s: &str) -> Result<()> {
    out.write_u64::<LE>(s.len() as u64)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn get_string(input: &mut impl Read) -> Result<String> {
    let len = input.read_u64::<LE>()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::parse("bfast", "non-utf8 header"))
}

fn write_mask(out: &mut impl Write, mask: &[bool]) -> Result<()> {
    out.write_u64::<LE>(mask.len() as u64)?;
    let mut byte = 0u8;
    for (i, &bit) in mask.iter().enumerate() {
        if bit {
            byte |= 1 << (i % 8);
        }
        if i % 8 == 7 {
            out.write_u8(byte)?;
            byte = 0;
        }
    }
    if mask.len() % 8 != 0 {
        out.write_u8(byte)?;
    }
    Ok(())
}

fn read_mask(input: &mut impl Read) -> Result<Vec<bool>> {
    let nbits = input.read_u64::<LE>()? as usize;
    let mut bytes = vec![0u8; nbits.div_ceil(8)];
    input.read_exact(&mut bytes)?;
    Ok((0..nbits).map(|i| bytes[i / 8] >> (i % 8) & 1 == 1).collect())
}

fn data_section_offset(num_sequences: usize, mask_len: usize) -> u64 {
    (MAGIC.len()
        + 8 // num_sequences
        + 8 + mask_len.div_ceil(8) // gap mask
        + num_sequences * 16) as u64 // offset table
}

fn write_header(
    out: &mut impl Write,
    entry_sizes: &[usize],
    mask: &[bool],
) -> Result<()> {
    out.write_all(MAGIC)?;
    out.write_u64::<LE>(entry_sizes.len() as u64)?;
    write_mask(out, mask)?;

    // the offset table enabling random access
    let mut offset = data_section_offset(entry_sizes.len(), mask.len());
    for (id, &size) in entry_sizes.iter().enumerate() {
        out.write_u64::<LE>(id as u64)?;
        out.write_u64::<LE>(offset)?;
        offset += size as u64;
    }
    Ok(())
}

fn read_header(input: &mut impl Read) -> Result<(Vec<u64>, Vec<bool>)> {
    let mut magic = [0u8; 6];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::parse("bfast", "file is not a binary fasta file"));
    }
    let num_sequences = input.read_u64::<LE>()? as usize;
    let mask = read_mask(input)?;
    let mut offsets = vec![0u64; num_sequences];
    for _ in 0..num_sequences {
        let id = input.read_u64::<LE>()? as usize;
        let offset = input.read_u64::<LE>()?;
        offsets[id] = offset;
    }
    Ok((offsets, mask))
}

/// byte size of one data entry: header string, length field, payload
fn entry_size(code: &FourBit, seq: &Sequence) -> usize {
    8 + seq.header().len() + 8 + code.packed_size(seq.len())
}

/// write an in-memory MSA as 4-bit fasta, with the all-gap column mask of
/// the alignment in the header
pub fn save(msa: &Msa, path: &Path) -> Result<()> {
    let code = FourBit::default();
    let info = MsaInfo::from_msa(msa);
    let mut out = BufWriter::new(std::fs::File::create(path)?);

    let sizes: Vec<usize> = msa.iter().map(|s| entry_size(&code, s)).collect();
    write_header(&mut out, &sizes, &info.gap_mask)?;

    for seq in msa {
        put_string(&mut out, seq.header())?;
        out.write_u64::<LE>(seq.len() as u64)?;
        out.write_all(&code.encode(seq.sequence())?)?;
    }
    out.flush()?;
    Ok(())
}

/// convert a text fasta file, streaming. fails on non-DNA input.
pub fn fasta_to_bfast(fasta_file: &Path, out_dir: &Path) -> Result<PathBuf> {
    let code = FourBit::default();

    // first pass: entry sizes and the gap mask
    let mut reader = crate::io::fasta::FastaReader::open(fasta_file)?;
    let mut sizes = Vec::new();
    let mut gap_mask: Vec<bool> = Vec::new();
    let mut chunk = Msa::default();
    while reader.read_next(&mut chunk, 1024)? > 0 {
        for seq in &chunk {
            if gap_mask.is_empty() {
                gap_mask = vec![true; seq.len()];
            }
            update_gap_mask(&mut gap_mask, seq.sequence());
            sizes.push(entry_size(&code, seq));
        }
    }

    let name = fasta_file
        .file_name()
        .ok_or_else(|| Error::parse(fasta_file.to_string_lossy(), "not a file"))?;
    let mut out_path = out_dir.join(name);
    out_path.set_extension("bfast");

    let mut out = BufWriter::new(std::fs::File::create(&out_path)?);
    write_header(&mut out, &sizes, &gap_mask)?;

    // second pass: the data
    let mut reader = crate::io::fasta::FastaReader::open(fasta_file)?;
    while reader.read_next(&mut chunk, 1024)? > 0 {
        for seq in &chunk {
            put_string(&mut out, seq.header())?;
            out.write_u64::<LE>(seq.len() as u64)?;
            out.write_all(&code.encode(seq.sequence())?)?;
        }
    }
    out.flush()?;
    Ok(out_path)
}

/// shape summary from a bfast header
pub fn get_info(path: &Path) -> Result<MsaInfo> {
    let mut file = BufReader::new(std::fs::File::open(path)?);
    let (offsets, mask) = read_header(&mut file)?;
    Ok(MsaInfo::new(offsets.len(), mask.len(), mask))
}

/// random-access reader over a 4-bit fasta file. optionally subsets every
/// decoded sequence by the stored non-gap columns (premasking).
pub struct BfastReader {
    file: BufReader<std::fs::File>,
    offsets: Vec<u64>,
    mask: Option<Vec<bool>>,
    max_read: usize,
    num_read: usize,
}

impl BfastReader {
    pub fn open(path: &Path, premasking: bool) -> Result<Self> {
        let mut file = BufReader::new(std::fs::File::open(path)?);
        let (offsets, mask) = read_header(&mut file)?;
        let use_mask = premasking && mask.iter().any(|&g| g);
        Ok(Self {
            file,
            offsets,
            mask: use_mask.then_some(mask),
            max_read: usize::MAX,
            num_read: 0,
        })
    }

    pub fn num_sequences(&self) -> usize {
        self.offsets.len()
    }

    pub fn constrain(&mut self, max_read: usize) {
        self.max_read = max_read;
    }

    pub fn skip_to_sequence(&mut self, n: usize) -> Result<()> {
        if n >= self.offsets.len() {
            return Err(Error::parse("bfast", "trying to skip out of bounds"));
        }
        self.file.seek(SeekFrom::Start(self.offsets[n]))?;
        self.num_read = 0;
        Ok(())
    }

    pub fn read_next(&mut self, out: &mut Msa, number: usize) -> Result<usize> {
        let code = FourBit::default();
        out.clear();
        let to_read = number.min(self.max_read.saturating_sub(self.num_read));
        for _ in 0..to_read {
            if self.file.fill_buf()?.is_empty() {
                break;
            }
            let header = get_string(&mut self.file)?;
            let decoded_len = self.file.read_u64::<LE>()? as usize;
            let mut packed = vec![0u8; code.packed_size(decoded_len)];
            self.file.read_exact(&mut packed)?;
            let mut sequence = code.decode(&packed, decoded_len);
            if let Some(mask) = &self.mask {
                sequence = subset_sequence(&sequence, mask);
            }
            out.append(Sequence::new(header, sequence));
        }
        self.num_read += out.size();
        Ok(out.size())
    }
}

/// cheap probe: does this file carry the bfast magic?
pub fn is_bfast(path: &Path) -> bool {
    let mut magic = [0u8; 6];
    match std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic == MAGIC,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrips_canonical_classes() {
        let code = FourBit::default();
        let packed = code.encode(b"ACGTN-RYSWKMBDHV").unwrap();
        assert_eq!(packed.len(), 8);
        assert_eq!(code.decode(&packed, 16), b"ACGTN-RYSWKMBDHV".to_vec());
    }

    #[test]
    fn codec_canonicalizes_case_and_synonyms() {
        let code = FourBit::default();
        let packed = code.encode(b"acg?u").unwrap();
        // odd length pads a trailing nibble
        assert_eq!(packed.len(), 3);
        assert_eq!(code.decode(&packed, 5), b"ACG-T".to_vec());
    }

    #[test]
    fn amino_acid_input_is_rejected() {
        let code = FourBit::default();
        assert!(matches!(
            code.encode(b"ACGE"),
            Err(Error::UnsupportedAlphabet('E'))
        ));
    }

    #[test]
    fn file_roundtrip_preserves_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.bfast");
        let mut msa = Msa::new(6);
        msa.append(Sequence::new("q1", b"ACGTAC".to_vec()));
        msa.append(Sequence::new("q2", b"acgtac".to_vec()));
        msa.append(Sequence::new("q3", b"NNACG-".to_vec()));
        save(&msa, &path).unwrap();

        let mut reader = BfastReader::open(&path, false).unwrap();
        assert_eq!(reader.num_sequences(), 3);
        let mut read = Msa::default();
        assert_eq!(reader.read_next(&mut read, 10).unwrap(), 3);
        assert_eq!(read.get(0).sequence(), b"ACGTAC");
        assert_eq!(read.get(1).sequence(), b"ACGTAC");
        assert_eq!(read.get(2).sequence(), b"NNACG-");
        assert_eq!(read.get(2).header(), "q3");
    }

    #[test]
    fn conversion_matches_direct_save() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("queries.fasta");
        std::fs::write(&fasta, ">q1\nACGT\n>q2\nacga\n").unwrap();
        let bfast = fasta_to_bfast(&fasta, dir.path()).unwrap();
        assert!(is_bfast(&bfast));

        let info = get_info(&bfast).unwrap();
        assert_eq!(info.sequences, 2);
        assert_eq!(info.sites, 4);

        let mut reader = BfastReader::open(&bfast, false).unwrap();
        let mut msa = Msa::default();
        reader.read_next(&mut msa, 10).unwrap();
        assert_eq!(msa.get(1).sequence(), b"ACGA");
    }

    #[test]
    fn premasking_subsets_all_gap_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.bfast");
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("q1", b"-CGT".to_vec()));
        msa.append(Sequence::new("q2", b"-CGA".to_vec()));
        save(&msa, &path).unwrap();

        let mut reader = BfastReader::open(&path, true).unwrap();
        let mut read = Msa::default();
        reader.read_next(&mut read, 10).unwrap();
        assert_eq!(read.get(0).sequence(), b"CGT");
        assert_eq!(read.get(1).sequence(), b"CGA");
    }

    #[test]
    fn skip_to_sequence_is_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.bfast");
        let mut msa = Msa::new(4);
        for i in 0..5 {
            msa.append(Sequence::new(format!("q{i}"), b"ACGT".to_vec()));
        }
        save(&msa, &path).unwrap();

        let mut reader = BfastReader::open(&path, false).unwrap();
        reader.skip_to_sequence(3).unwrap();
        let mut read = Msa::default();
        reader.read_next(&mut read, 10).unwrap();
        assert_eq!(read.size(), 2);
        assert_eq!(read.get(0).header(), "q3");
    }
}
