use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::thread::JoinHandle;

use serde_json::json;

use crate::error::Result;
use crate::sample::pquery::PQuery;
use crate::sample::sample::Sample;
use crate::tree::mapper::RtreeMapper;

/// streaming jplace (version 3) emitter. each `write` call serializes a
/// chunk's sample asynchronously; the trailer with the metadata goes out
/// on `close`. under multi-rank execution every rank streams its own part
/// file, rank 0 owning the canonical name.
pub struct JplaceWriter {
    path: PathBuf,
    state: Option<State>,
    invocation: String,
    mapper: RtreeMapper,
    first: bool,
    closed: bool,
}

struct Inner {
    file: std::io::BufWriter<std::fs::File>,
}

enum State {
    Ready(Inner),
    Pending(JoinHandle<(Inner, Result<()>)>),
}

/// canonical per-rank output name
pub fn output_file_name(rank: usize) -> String {
    if rank == 0 {
        "epa_result.jplace".to_string()
    } else {
        format!("epa_result.{rank}.jplace")
    }
}

impl JplaceWriter {
    pub fn create(
        out_dir: &Path,
        file_name: &str,
        tree_string: &str,
        invocation: &str,
        mapper: RtreeMapper,
    ) -> Result<Self> {
        let path = out_dir.join(file_name);
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        write!(file, "{{\n  \"tree\": \"{}\",\n  \"placements\": [", tree_string)?;
        Ok(Self {
            path,
            state: Some(State::Ready(Inner { file })),
            invocation: invocation.to_string(),
            mapper,
            first: true,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// block until the previous asynchronous write has landed
    pub fn wait(&mut self) -> Result<()> {
        if let Some(State::Pending(handle)) = self.state.take() {
            let (inner, result) = handle.join().expect("jplace writer thread panicked");
            self.state = Some(State::Ready(inner));
            result?;
        }
        Ok(())
    }

    /// serialize and append a sample, asynchronously with respect to the
    /// caller. samples arrive in chunk order per rank.
    pub fn write(&mut self, sample: Sample) -> Result<()> {
        self.wait()?;
        if sample.is_empty() {
            return Ok(());
        }
        let Some(State::Ready(mut inner)) = self.state.take() else {
            unreachable!("writer state after wait");
        };
        let first = self.first;
        self.first = false;
        let mapper = self.mapper.clone();
        self.state = Some(State::Pending(std::thread::spawn(move || {
            let result = write_sample(&mut inner.file, &sample, &mapper, first);
            (inner, result)
        })));
        Ok(())
    }

    /// write the closing bracket, metadata, version and field order
    pub fn close(&mut self) -> Result<()> {
        self.wait()?;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(State::Ready(inner)) = self.state.as_mut() else {
            unreachable!("writer state after wait");
        };
        let file = &mut inner.file;
        writeln!(file, "\n  ],")?;
        writeln!(
            file,
            "  \"metadata\": {{\"invocation\": \"{}\"}},",
            self.invocation
        )?;
        writeln!(file, "  \"version\": 3,")?;
        writeln!(
            file,
            "  \"fields\": [\"edge_num\", \"likelihood\", \"like_weight_ratio\", \"distal_length\", \"pendant_length\"]"
        )?;
        writeln!(file, "}}")?;
        file.flush()?;
        Ok(())
    }
}

impl Drop for JplaceWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn write_sample(
    file: &mut impl Write,
    sample: &Sample,
    mapper: &RtreeMapper,
    mut first: bool,
) -> Result<()> {
    for pquery in sample {
        if !first {
            write!(file, ",")?;
        }
        first = false;
        write!(file, "\n    {}", pquery_to_json(pquery, mapper))?;
    }
    Ok(())
}

fn pquery_to_json(pquery: &PQuery, mapper: &RtreeMapper) -> serde_json::Value {
    let placements: Vec<serde_json::Value> = pquery
        .iter()
        .map(|p| {
            let (edge_num, distal_length) = if mapper.is_active() {
                mapper.in_rtree(p.branch_id(), p.distal_length())
            } else {
                (p.branch_id(), p.distal_length())
            };
            json!([
                edge_num,
                p.likelihood(),
                p.lwr(),
                distal_length,
                p.pendant_length()
            ])
        })
        .collect();
    json!({ "p": placements, "n": [pquery.header()] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::placement::Placement;

    fn sample_with(seq_id: usize, branch: usize) -> Sample {
        let mut pq = PQuery::new(seq_id, format!("q{seq_id}"));
        let mut p = Placement::new(branch, -12.5, 0.1, 0.05);
        p.set_lwr(1.0);
        pq.push(p);
        let mut sample = Sample::new("(A:1{0},B:1{1},C:1{2});");
        sample.push(pq);
        sample
    }

    #[test]
    fn document_is_valid_json_with_ordered_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JplaceWriter::create(
            dir.path(),
            &output_file_name(0),
            "(A:1{0},B:1{1},C:1{2});",
            "epa-ng -q test",
            RtreeMapper::default(),
        )
        .unwrap();
        writer.write(sample_with(0, 1)).unwrap();
        writer.write(sample_with(1, 2)).unwrap();
        writer.close().unwrap();

        let text = std::fs::read_to_string(dir.path().join("epa_result.jplace")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["version"], 3);
        assert_eq!(
            doc["fields"],
            json!([
                "edge_num",
                "likelihood",
                "like_weight_ratio",
                "distal_length",
                "pendant_length"
            ])
        );
        assert_eq!(doc["placements"].as_array().unwrap().len(), 2);
        assert_eq!(doc["placements"][0]["n"][0], "q0");
        assert_eq!(doc["placements"][1]["p"][0][0], 2);
        assert!(doc["tree"].as_str().unwrap().contains("{1}"));
        assert_eq!(doc["metadata"]["invocation"], "epa-ng -q test");
    }

    #[test]
    fn empty_samples_leave_a_valid_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JplaceWriter::create(
            dir.path(),
            &output_file_name(0),
            "(A:1{0},B:1{1},C:1{2});",
            "invocation",
            RtreeMapper::default(),
        )
        .unwrap();
        writer.write(Sample::default()).unwrap();
        writer.close().unwrap();
        let text = std::fs::read_to_string(dir.path().join("epa_result.jplace")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["placements"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn rooted_mapper_translates_edges_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = RtreeMapper::new(1, 3, 2, 0.5, 0.5, true, vec![0, 2, 1]);
        let mut writer = JplaceWriter::create(
            dir.path(),
            &output_file_name(0),
            "tree",
            "invocation",
            mapper,
        )
        .unwrap();
        writer.write(sample_with(0, 0)).unwrap();
        writer.close().unwrap();
        let text = std::fs::read_to_string(dir.path().join("epa_result.jplace")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["placements"][0]["p"][0][0], 0);
    }

    #[test]
    fn part_files_are_named_by_rank() {
        assert_eq!(output_file_name(0), "epa_result.jplace");
        assert_eq!(output_file_name(3), "epa_result.3.jplace");
    }
}
