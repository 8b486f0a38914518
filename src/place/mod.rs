pub mod buffer;
pub mod heuristics;
pub mod lookup;
pub mod work;

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::BranchId;
use crate::SeqId;
use crate::error::Result;
use crate::io::jplace::JplaceWriter;
use crate::io::jplace::output_file_name;
use crate::io::msa::Msa;
use crate::io::stream::MsaReader;
use crate::options::Options;
use crate::place::buffer::BranchBuffer;
use crate::place::heuristics::apply_heuristic;
use crate::place::lookup::LookupPlacement;
use crate::place::work::Work;
use crate::sample::functions;
use crate::sample::functions::compute_and_set_lwr;
use crate::sample::pquery::PQuery;
use crate::sample::sample::Sample;
use crate::tree::reference::ReferenceTree;
use crate::tree::tiny::TinyTree;

/// the thread-parallel placement kernel: partition the flattened work into
/// per-thread slices, reuse the tiny tree while consecutive items stay on
/// the same branch, then merge and collapse the thread-local samples.
#[allow(clippy::too_many_arguments)]
fn place(
    to_place: &Work,
    chunk: &Msa,
    reference: &Arc<ReferenceTree>,
    branches: &[usize],
    sample: &mut Sample,
    do_blo: bool,
    options: &Options,
    seq_id_offset: usize,
) -> Result<()> {
    let pairs: Vec<(BranchId, SeqId)> = to_place.iter().collect();
    if pairs.is_empty() {
        return Ok(());
    }
    let num_threads = options.threads().max(1);
    log::debug!("using threads: {num_threads}");
    let per_thread = pairs.len().div_ceil(num_threads);

    let parts: Vec<Result<Sample>> = pairs
        .par_chunks(per_thread)
        .map(|slice| {
            let mut local = Sample::default();
            let mut seq_lookup: HashMap<SeqId, usize> = HashMap::new();
            let mut branch_ptr: Option<TinyTree> = None;
            let mut prev_branch_id = usize::MAX;

            for &(branch_id, seq_id) in slice {
                // rebuild the tiny tree only when the branch changes
                if branch_id != prev_branch_id || branch_ptr.is_none() {
                    branch_ptr = Some(TinyTree::new(
                        reference,
                        branches[branch_id],
                        branch_id,
                        false,
                    )?);
                }
                let seq = chunk.get(seq_id);
                let placement = branch_ptr
                    .as_mut()
                    .expect("tiny tree was just built")
                    .place(seq, do_blo, options)?;

                let index = match seq_lookup.get(&seq_id) {
                    Some(&i) => i,
                    None => {
                        let i = local.add_pquery(seq_id_offset + seq_id, seq.header());
                        seq_lookup.insert(seq_id, i);
                        i
                    }
                };
                local.get_mut(index).push(placement);
                prev_branch_id = branch_id;
            }
            Ok(local)
        })
        .collect();

    for part in parts {
        functions::merge(sample, part?);
    }
    functions::collapse(sample);
    Ok(())
}

/// branch-major kernel under the memory saver: consume blocks of
/// deep-copied tiny trees from the branch buffer, each worker placing all
/// of its branch's queries
#[allow(clippy::too_many_arguments)]
fn place_memsave(
    to_place: &Work,
    chunk: &Msa,
    reference: &Arc<ReferenceTree>,
    sample: &mut Sample,
    do_blo: bool,
    options: &Options,
    seq_id_offset: usize,
) -> Result<()> {
    let block_size = reference
        .memsave
        .as_ref()
        .expect("memsave kernel requires the memory saver")
        .config
        .concurrent_branches;

    let mut buffer = BranchBuffer::with_whitelist(reference.clone(), block_size, to_place);
    let mut block = Vec::new();
    while buffer.get_next(&mut block)? > 0 {
        let parts: Vec<Result<Sample>> = block
            .par_iter_mut()
            .map(|tiny| {
                let mut local = Sample::default();
                let mut seq_lookup: HashMap<SeqId, usize> = HashMap::new();
                for &seq_id in to_place.at(tiny.branch_id()) {
                    let seq = chunk.get(seq_id);
                    let placement = tiny.place(seq, do_blo, options)?;
                    let index = match seq_lookup.get(&seq_id) {
                        Some(&i) => i,
                        None => {
                            let i = local.add_pquery(seq_id_offset + seq_id, seq.header());
                            seq_lookup.insert(seq_id, i);
                            i
                        }
                    };
                    local.get_mut(index).push(placement);
                }
                Ok(local)
            })
            .collect();
        for part in parts {
            functions::merge(sample, part?);
        }
    }
    functions::collapse(sample);
    Ok(())
}

/// score every branch for every query straight from the lookup store
fn preplace_lookup(
    lookup: &LookupPlacement,
    chunk: &Msa,
    sample: &mut Sample,
    options: &Options,
) -> Result<()> {
    let pqs: Vec<Result<PQuery>> = (0..chunk.size())
        .into_par_iter()
        .map(|seq_id| {
            let seq = chunk.get(seq_id);
            let mut pq = PQuery::new(seq_id, seq.header());
            for branch_id in 0..lookup.num_branches() {
                pq.push(lookup.place(branch_id, seq, options.premasking)?);
            }
            Ok(pq)
        })
        .collect();
    for pq in pqs {
        sample.push(pq?);
    }
    Ok(())
}

/// the two-phase pipeline over chunks: read, pre-score all edges, select
/// candidates, place thoroughly, normalize, filter, stream to jplace
pub fn process(
    reference: Arc<ReferenceTree>,
    reader: &mut dyn MsaReader,
    options: &Options,
) -> Result<()> {
    let branches = reference.branches();
    let num_branches = branches.len();
    let numbered_newick = reference.tree.numbered_newick();
    let use_memsave = reference.memsave.is_some();

    // lookup-backed pre-scoring, unless the memory budget ruled it out
    let lookup = if options.prescoring {
        let affordable = reference
            .memsave
            .as_ref()
            .is_none_or(|ms| ms.config.preplace_lookup_enabled);
        if affordable {
            log::info!("precomputing the per-branch lookup table");
            Some(LookupPlacement::new(&reference, &branches)?)
        } else {
            None
        }
    } else {
        None
    };

    let mut writer = JplaceWriter::create(
        &options.out_dir,
        &output_file_name(options.rank),
        &numbered_newick,
        &options.invocation,
        reference.mapper.clone(),
    )?;

    let local_seq_offset = reader.local_seq_offset();
    let mut sequences_done = 0usize;

    loop {
        let mut chunk = Msa::default();
        let num_sequences = reader.read_next(&mut chunk, options.chunk_size)?;
        if num_sequences == 0 {
            break;
        }
        let seq_id_offset = sequences_done + local_seq_offset;

        let all_work = Work::all(num_branches, num_sequences);
        let blo_work = if options.prescoring {
            log::debug!("preplacement");
            let mut presample = Sample::new(&numbered_newick);
            match &lookup {
                Some(lookup) => preplace_lookup(lookup, &chunk, &mut presample, options)?,
                None if use_memsave => place_memsave(
                    &all_work,
                    &chunk,
                    &reference,
                    &mut presample,
                    false,
                    options,
                    0,
                )?,
                None => place(
                    &all_work,
                    &chunk,
                    &reference,
                    &branches,
                    &mut presample,
                    false,
                    options,
                    0,
                )?,
            }
            log::debug!("selecting candidates");
            apply_heuristic(&mut presample, options);
            Work::from(&presample)
        } else {
            all_work
        };

        log::debug!("thorough placement");
        let mut sample = Sample::new(&numbered_newick);
        if use_memsave {
            place_memsave(
                &blo_work,
                &chunk,
                &reference,
                &mut sample,
                true,
                options,
                seq_id_offset,
            )?;
        } else {
            place(
                &blo_work,
                &chunk,
                &reference,
                &branches,
                &mut sample,
                true,
                options,
                seq_id_offset,
            )?;
        }

        compute_and_set_lwr(&mut sample);
        functions::filter(&mut sample, options);
        writer.write(sample)?;

        sequences_done += num_sequences;
        log::info!("{sequences_done} Sequences done!");
    }

    writer.wait()?;
    writer.close()?;
    log::info!("output file: {}", writer.path().display());
    Ok(())
}
