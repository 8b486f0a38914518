use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use byteorder::LE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;

use crate::engine::model::SubstModel;
use crate::engine::partition::Partition;
use crate::error::Error;
use crate::error::Result;
use crate::tree::utree::HalfEdge;
use crate::tree::utree::Utree;

const MAGIC: &[u8; 8] = b"EPA_BIN\0";
const ACCESS_RANDOM: u8 = 1;

// negative sentinels identify the metadata blocks; tipchars, CLVs and
// scalers follow under their non-negative indices
const BLOCK_TREE: i64 = -2;
const BLOCK_PARTITION: i64 = -1;

const NONE: u64 = u64::MAX;
const PATTERN_TIP_ATTR: u32 = 1;

/// random-access on-disk persistence of a fully computed partition plus the
/// tree it belongs to. written once in dump mode, read-only afterwards: the
/// reference tree materializes tipchars, CLVs and scalers lazily through
/// the memoized block map.
pub struct BinaryStore {
    file: Mutex<BufReader<File>>,
    map: Vec<(i64, u64)>,
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
    String::from_utf8(buf).map_err(|_| Error::parse("binary", "non-utf8 string block"))
}

impl BinaryStore {
    /// write the partition and tree as a block-indexed random access file.
    /// every CLV, tipchar and scaler must be materialized beforehand.
    pub fn dump(tree: &Utree, part: &Partition, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        let n_blocks = 2 + part.tips + part.clv_buffers + part.scale_buffers;

        out.write_all(MAGIC)?;
        out.write_u32::<LE>(1)?; // format version
        out.write_u8(ACCESS_RANDOM)?;
        out.write_u64::<LE>(n_blocks as u64)?;
        let map_offset_pos = out.stream_position()?;
        out.write_u64::<LE>(0)?; // patched once the block map is written

        let mut map: Vec<(i64, u64)> = Vec::with_capacity(n_blocks);

        map.push((BLOCK_TREE, out.stream_position()?));
        write_tree(&mut out, tree)?;

        map.push((BLOCK_PARTITION, out.stream_position()?));
        write_partition_header(&mut out, part)?;

        for tip in 0..part.tips {
            map.push((tip as i64, out.stream_position()?));
            if part.pattern_tip {
                let chars = part
                    .tipchar(tip)
                    .ok_or(Error::ClvUnavailable(tip))?;
                out.write_u64::<LE>(chars.len() as u64)?;
                for &c in chars {
                    out.write_u32::<LE>(c)?;
                }
            } else {
                out.write_u64::<LE>(0)?;
            }
        }

        for j in 0..part.clv_buffers {
            let clv_index = part.tips + j;
            map.push((clv_index as i64, out.stream_position()?));
            let clv = part
                .clv(clv_index)
                .ok_or(Error::ClvUnavailable(clv_index))?;
            out.write_u64::<LE>(clv.len() as u64)?;
            for &v in clv {
                out.write_f64::<LE>(v)?;
            }
        }

        let scaler_base = part.tips + part.clv_buffers;
        for k in 0..part.scale_buffers {
            map.push(((scaler_base + k) as i64, out.stream_position()?));
            match part.scaler(k) {
                None => out.write_u8(0)?,
                Some(s) => {
                    out.write_u8(1)?;
                    out.write_u64::<LE>(s.len() as u64)?;
                    for &v in s {
                        out.write_u32::<LE>(v)?;
                    }
                }
            }
        }

        // block map at the file tail
        let map_offset = out.stream_position()?;
        for (block_id, offset) in &map {
            out.write_i64::<LE>(*block_id)?;
            out.write_u64::<LE>(*offset)?;
        }
        out.seek(SeekFrom::Start(map_offset_pos))?;
        out.write_u64::<LE>(map_offset)?;
        out.flush()?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::parse(
                path.to_string_lossy(),
                "not an epa binary file",
            ));
        }
        let _version = file.read_u32::<LE>()?;
        if file.read_u8()? != ACCESS_RANDOM {
            return Err(Error::parse(
                path.to_string_lossy(),
                "binary file must be random access enabled",
            ));
        }
        let n_blocks = file.read_u64::<LE>()? as usize;
        if n_blocks == 0 {
            return Err(Error::parse(
                path.to_string_lossy(),
                "binary file header must have a nonzero number of blocks",
            ));
        }
        let map_offset = file.read_u64::<LE>()?;

        file.seek(SeekFrom::Start(map_offset))?;
        let mut map = Vec::with_capacity(n_blocks);
        for _ in 0..n_blocks {
            let block_id = file.read_i64::<LE>()?;
            let offset = file.read_u64::<LE>()?;
            map.push((block_id, offset));
        }

        Ok(Self {
            file: Mutex::new(file),
            map,
        })
    }

    fn offset_of(&self, block_id: i64) -> Result<u64> {
        self.map
            .iter()
            .find(|(id, _)| *id == block_id)
            .map(|(_, offset)| *offset)
            .ok_or_else(|| Error::parse("binary", format!("map does not contain block {block_id}")))
    }

    pub fn load_utree(&self) -> Result<Utree> {
        let offset = self.offset_of(BLOCK_TREE)?;
        let mut file = self.file.lock().expect("binary file mutex");
        file.seek(SeekFrom::Start(offset))?;
        read_tree(&mut *file)
    }

    /// skeleton partition: model, pattern weights and probability matrices,
    /// with all CLV-like buffers left unmaterialized
    pub fn load_partition(&self) -> Result<Partition> {
        let offset = self.offset_of(BLOCK_PARTITION)?;
        let mut file = self.file.lock().expect("binary file mutex");
        file.seek(SeekFrom::Start(offset))?;
        read_partition_header(&mut *file)
    }

    pub fn load_clv(&self, part: &mut Partition, clv_index: usize) -> Result<()> {
        assert!(clv_index < part.tips + part.clv_buffers);
        if part.pattern_tip {
            assert!(clv_index >= part.tips);
        }
        let offset = self.offset_of(clv_index as i64)?;
        let buf = {
            let mut file = self.file.lock().expect("binary file mutex");
            file.seek(SeekFrom::Start(offset))?;
            let len = file.read_u64::<LE>()? as usize;
            let mut buf = vec![0.0f64; len];
            file.read_f64_into::<LE>(&mut buf)?;
            buf
        };
        part.insert_clv(clv_index, buf)
    }

    pub fn load_tipchars(&self, part: &mut Partition, tip_index: usize) -> Result<()> {
        assert!(tip_index < part.tips);
        assert!(part.pattern_tip);
        let offset = self.offset_of(tip_index as i64)?;
        let buf = {
            let mut file = self.file.lock().expect("binary file mutex");
            file.seek(SeekFrom::Start(offset))?;
            let len = file.read_u64::<LE>()? as usize;
            let mut buf = vec![0u32; len];
            file.read_u32_into::<LE>(&mut buf)?;
            buf
        };
        part.insert_tipchars(tip_index, Arc::new(buf));
        Ok(())
    }

    pub fn load_scaler(&self, part: &mut Partition, scaler_index: usize) -> Result<()> {
        assert!(scaler_index < part.scale_buffers);
        let block = (part.tips + part.clv_buffers + scaler_index) as i64;
        let offset = self.offset_of(block)?;
        let buf = {
            let mut file = self.file.lock().expect("binary file mutex");
            file.seek(SeekFrom::Start(offset))?;
            if file.read_u8()? == 0 {
                None
            } else {
                let len = file.read_u64::<LE>()? as usize;
                let mut buf = vec![0u32; len];
                file.read_u32_into::<LE>(&mut buf)?;
                Some(buf)
            }
        };
        if let Some(buf) = buf {
            part.insert_scaler(scaler_index, Arc::new(buf));
        }
        Ok(())
    }
}

fn write_tree(out: &mut impl Write, tree: &Utree) -> Result<()> {
    out.write_u64::<LE>(tree.tip_count as u64)?;
    out.write_u64::<LE>(tree.inner_count as u64)?;
    out.write_u64::<LE>(tree.vroot as u64)?;
    out.write_u64::<LE>(tree.halves.len() as u64)?;
    for h in &tree.halves {
        out.write_u64::<LE>(h.back as u64)?;
        out.write_u64::<LE>(h.next.map_or(NONE, |n| n as u64))?;
        out.write_u64::<LE>(h.clv_index as u64)?;
        out.write_u64::<LE>(h.scaler_index.map_or(NONE, |s| s as u64))?;
        out.write_u64::<LE>(h.pmatrix_index as u64)?;
        out.write_f64::<LE>(h.length)?;
        match &h.label {
            None => out.write_u8(0)?,
            Some(label) => {
                out.write_u8(1)?;
                put_string(out, label)?;
            }
        }
    }
    Ok(())
}

fn read_tree(input: &mut impl Read) -> Result<Utree> {
    let tip_count = input.read_u64::<LE>()? as usize;
    let inner_count = input.read_u64::<LE>()? as usize;
    let vroot = input.read_u64::<LE>()? as usize;
    let num_halves = input.read_u64::<LE>()? as usize;
    let mut halves = Vec::with_capacity(num_halves);
    for _ in 0..num_halves {
        let back = input.read_u64::<LE>()? as usize;
        let next = match input.read_u64::<LE>()? {
            NONE => None,
            n => Some(n as usize),
        };
        let clv_index = input.read_u64::<LE>()? as usize;
        let scaler_index = match input.read_u64::<LE>()? {
            NONE => None,
            s => Some(s as usize),
        };
        let pmatrix_index = input.read_u64::<LE>()? as usize;
        let length = input.read_f64::<LE>()?;
        let label = if input.read_u8()? == 1 {
            Some(get_string(input)?)
        } else {
            None
        };
        halves.push(HalfEdge {
            back,
            next,
            clv_index,
            scaler_index,
            pmatrix_index,
            length,
            label,
        });
    }
    Ok(Utree {
        halves,
        tip_count,
        inner_count,
        vroot,
    })
}

fn write_partition_header(out: &mut impl Write, part: &Partition) -> Result<()> {
    out.write_u64::<LE>(part.sites as u64)?;
    out.write_u64::<LE>(part.states() as u64)?;
    out.write_u64::<LE>(part.rate_cats() as u64)?;
    out.write_u64::<LE>(part.tips as u64)?;
    out.write_u64::<LE>(part.clv_buffers as u64)?;
    out.write_u64::<LE>(part.scale_buffers as u64)?;
    out.write_u64::<LE>(part.pmatrix_count() as u64)?;
    let attributes = if part.pattern_tip { PATTERN_TIP_ATTR } else { 0 };
    out.write_u32::<LE>(attributes)?;

    for &w in &part.pattern_weights {
        out.write_u32::<LE>(w)?;
    }

    put_string(out, &part.model.name)?;
    out.write_f64::<LE>(part.model.alpha)?;
    for &f in &part.model.freqs {
        out.write_f64::<LE>(f)?;
    }
    for &r in &part.model.subst_rates {
        out.write_f64::<LE>(r)?;
    }

    for i in 0..part.pmatrix_count() {
        match part.pmatrix_opt(i) {
            None => out.write_u8(0)?,
            Some(m) => {
                out.write_u8(1)?;
                for &v in m {
                    out.write_f64::<LE>(v)?;
                }
            }
        }
    }
    Ok(())
}

fn read_partition_header(input: &mut impl Read) -> Result<Partition> {
    let sites = input.read_u64::<LE>()? as usize;
    let states = input.read_u64::<LE>()? as usize;
    let rate_cats = input.read_u64::<LE>()? as usize;
    let tips = input.read_u64::<LE>()? as usize;
    let clv_buffers = input.read_u64::<LE>()? as usize;
    let scale_buffers = input.read_u64::<LE>()? as usize;
    let pmatrix_count = input.read_u64::<LE>()? as usize;
    let attributes = input.read_u32::<LE>()?;
    let pattern_tip = attributes & PATTERN_TIP_ATTR != 0;

    let mut pattern_weights = vec![0u32; sites];
    input.read_u32_into::<LE>(&mut pattern_weights)?;

    let name = get_string(input)?;
    let alpha = input.read_f64::<LE>()?;
    let mut freqs = vec![0.0; states];
    input.read_f64_into::<LE>(&mut freqs)?;
    let n_rates = states * (states - 1) / 2;
    let mut subst_rates = vec![0.0; n_rates];
    input.read_f64_into::<LE>(&mut subst_rates)?;

    let mut model = SubstModel::new(&name, rate_cats)?;
    model.set_alpha(alpha);
    model.set_freqs(freqs)?;
    model.set_subst_rates(subst_rates)?;

    let mut part = Partition::new(
        Arc::new(model),
        sites,
        tips,
        clv_buffers,
        scale_buffers,
        pmatrix_count,
        pattern_tip,
        None,
    );
    part.pattern_weights = pattern_weights;

    let pmat_len = rate_cats * states * states;
    for i in 0..pmatrix_count {
        if input.read_u8()? == 1 {
            let mut buf = vec![0.0; pmat_len];
            input.read_f64_into::<LE>(&mut buf)?;
            part.insert_pmatrix(i, buf);
        }
    }
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::newick;

    fn small_partition() -> (Utree, Partition) {
        let (tree, _) = newick::parse("((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);").unwrap();
        let model = Arc::new(SubstModel::new("GTR", 4).unwrap());
        let nums = tree.nums();
        let mut part = Partition::new(
            model,
            4,
            nums.tip_nodes,
            3 * nums.inner_nodes,
            nums.scalers,
            nums.branches,
            true,
            None,
        );
        part.set_tip_states(0, b"ACGT").unwrap();
        part.set_tip_states(1, b"ACGA").unwrap();
        part.set_tip_states(2, b"ACGG").unwrap();
        part.set_tip_states(3, b"ACGC").unwrap();
        for clv in nums.tip_nodes..nums.tip_nodes + 3 * nums.inner_nodes {
            part.insert_clv(clv, vec![clv as f64; part.clv_len()]).unwrap();
        }
        for b in 0..nums.branches {
            part.update_pmatrix(b, 0.1);
        }
        (tree, part)
    }

    #[test]
    fn dump_and_load_roundtrip_is_bytewise() {
        let (tree, part) = small_partition();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");

        BinaryStore::dump(&tree, &part, &path).unwrap();
        let store = BinaryStore::open(&path).unwrap();

        let read_tree = store.load_utree().unwrap();
        assert_eq!(read_tree.tip_count, tree.tip_count);
        assert_eq!(read_tree.vroot, tree.vroot);
        assert_eq!(read_tree.query_branches(), tree.query_branches());

        let mut read_part = store.load_partition().unwrap();
        assert_eq!(read_part.sites, part.sites);
        assert_eq!(read_part.pattern_tip, part.pattern_tip);
        for b in 0..part.pmatrix_count() {
            assert_eq!(read_part.pmatrix(b), part.pmatrix(b));
        }

        for tip in 0..part.tips {
            store.load_tipchars(&mut read_part, tip).unwrap();
            assert_eq!(read_part.tipchar(tip).unwrap(), part.tipchar(tip).unwrap());
        }
        for clv in part.tips..part.tips + part.clv_buffers {
            store.load_clv(&mut read_part, clv).unwrap();
            assert_eq!(read_part.clv(clv).unwrap(), part.clv(clv).unwrap());
        }
        for s in 0..part.scale_buffers {
            store.load_scaler(&mut read_part, s).unwrap();
        }
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, b"definitely not a binary store").unwrap();
        assert!(BinaryStore::open(&path).is_err());
    }
}
