//! Evolutionary placement of query sequences on a fixed reference tree.
//!
//! Reads a reference tree + MSA (or a precomputed binary), streams query
//! sequences in chunks, and writes the placements as jplace.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;

use epa::engine::model::SubstModel;
use epa::io::binary::BinaryStore;
use epa::io::fasta;
use epa::io::msa::MsaInfo;
use epa::io::stream;
use epa::io::stream::InMemoryReader;
use epa::io::stream::MsaReader;
use epa::memory::MemorySaver;
use epa::options::MemoryMode;
use epa::options::Options;
use epa::tree::reference::ReferenceTree;

#[derive(Parser)]
#[command(
    name = "epa-ng",
    version,
    about = "Massively parallel evolutionary placement of genetic sequences"
)]
struct Args {
    /// reference tree file (newick, rooted or unrooted)
    #[arg(short = 't', long = "tree")]
    tree: Option<PathBuf>,

    /// reference MSA file (fasta or phylip). may also contain the queries
    #[arg(short = 's', long = "ref-msa")]
    ref_msa: Option<PathBuf>,

    /// query sequences (fasta or 4-bit fasta)
    #[arg(short = 'q', long = "query")]
    query: Option<PathBuf>,

    /// output directory
    #[arg(short = 'w', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    /// load the reference from a binary dump instead of -t/-s
    #[arg(short = 'b', long = "binary")]
    binary: Option<PathBuf>,

    /// dump the reference partition to binary, then exit
    #[arg(short = 'B', long = "dump-binary")]
    dump_binary: bool,

    /// optimize model parameters and branch lengths on the reference
    #[arg(short = 'O', long = "opt-ref")]
    opt_ref: bool,

    /// substitution model (GTR, JC69, K80, POISSON)
    #[arg(short = 'm', long = "model", default_value = "GTR")]
    model: String,

    /// number of gamma rate categories
    #[arg(long = "rate-cats", default_value_t = 4)]
    rate_cats: usize,

    /// use empirical base frequencies from the reference MSA
    #[arg(long = "empirical-freqs")]
    empirical_freqs: bool,

    /// two-phase heuristic, candidate edges by accumulated lwr threshold
    #[arg(short = 'g', long = "heuristic-acc", value_name = "X")]
    prescore_acc: Option<f64>,

    /// two-phase heuristic, candidate edges by fraction of all edges
    #[arg(short = 'G', long = "heuristic-pct", value_name = "X")]
    prescore_pct: Option<f64>,

    /// baseball candidate selection on raw log-likelihoods
    #[arg(long = "heuristic-baseball")]
    baseball: bool,

    /// disable the two-phase heuristic: thorough placement on every edge
    #[arg(long = "no-heur")]
    no_heur: bool,

    /// discard placements with lwr below this value
    #[arg(short = 'l', long = "min-lwr", value_name = "X")]
    support_threshold: Option<f64>,

    /// discard placements once their accumulated lwr passes this value
    #[arg(short = 'L', long = "acc-lwr", value_name = "X")]
    acc_threshold: Option<f64>,

    /// minimum number of placements kept per query
    #[arg(long = "filter-min", default_value_t = epa::DEFAULT_FILTER_MIN)]
    filter_min: usize,

    /// maximum number of placements kept per query
    #[arg(long = "filter-max", default_value_t = epa::DEFAULT_FILTER_MAX)]
    filter_max: usize,

    /// only consider the part of each query not flanked by gaps
    #[arg(short = 'r', long = "premask")]
    premask: bool,

    /// keep tiny-tree branch lengths between queries on the same branch
    #[arg(long = "no-sliding-blo")]
    no_sliding_blo: bool,

    /// number of worker threads (0 = hardware maximum)
    #[arg(short = 'T', long = "threads", default_value_t = 0)]
    threads: usize,

    /// query sequences per chunk
    #[arg(short = 'c', long = "chunk-size", default_value_t = epa::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// disable asynchronous chunk prefetching
    #[arg(long = "no-prefetch")]
    no_prefetch: bool,

    /// memory limit (e.g. 12G, 512M, or auto)
    #[arg(long = "max-memory", value_name = "AMOUNT")]
    max_memory: Option<String>,

    /// memory saver mode: off, auto, or full
    #[arg(long = "memsave", default_value = "off")]
    memsave: String,

    /// total number of logical ranks sharding the query file
    #[arg(long = "num-ranks", default_value_t = 1)]
    num_ranks: usize,

    /// index of this rank
    #[arg(long = "rank", default_value_t = 0)]
    rank: usize,
}

fn main() {
    let args = Args::parse();
    std::fs::create_dir_all(&args.out_dir).expect("create output directory");
    epa::init(&args.out_dir);

    if let Err(e) = run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn build_options(args: &Args) -> anyhow::Result<Options> {
    let mut options = Options {
        out_dir: args.out_dir.clone(),
        invocation: std::env::args().collect::<Vec<_>>().join(" "),
        opt_model: args.opt_ref,
        opt_branches: args.opt_ref,
        premasking: args.premask,
        empirical_freqs: args.empirical_freqs,
        sliding_blo: !args.no_sliding_blo,
        baseball: args.baseball,
        filter_min: args.filter_min,
        filter_max: args.filter_max,
        chunk_size: args.chunk_size,
        num_threads: args.threads,
        num_ranks: args.num_ranks,
        rank: args.rank,
        max_memory: args.max_memory.clone(),
        ..Options::default()
    };

    if args.prescore_acc.is_some() && args.prescore_pct.is_some() {
        bail!("-g cannot be used simultaneously with -G");
    }
    if let Some(x) = args.prescore_acc {
        if !(0.0..=1.0).contains(&x) {
            bail!("prescoring threshold out of range [0,1]: {x}");
        }
        options.prescoring = true;
        options.prescoring_by_percentage = false;
        options.prescoring_threshold = x;
    }
    if let Some(x) = args.prescore_pct {
        if !(0.0..=1.0).contains(&x) {
            bail!("prescoring threshold out of range [0,1]: {x}");
        }
        options.prescoring = true;
        options.prescoring_by_percentage = true;
        options.prescoring_threshold = x;
    }
    if args.no_heur {
        options.prescoring = false;
    }

    if let Some(x) = args.support_threshold {
        if !(0.0..1.0).contains(&x) {
            bail!("support threshold out of range [0,1): {x}");
        }
        options.acc_threshold = false;
        options.support_threshold = x;
    }
    if let Some(x) = args.acc_threshold {
        if !(x > 0.0 && x <= 1.0) {
            bail!("accumulated support threshold out of range (0,1]: {x}");
        }
        options.acc_threshold = true;
        options.support_threshold = x;
    }

    options.memsave = match args.memsave.as_str() {
        "off" => MemoryMode::Off,
        "auto" => MemoryMode::Auto,
        "full" => MemoryMode::Full,
        other => bail!("unknown memsave mode: {other}"),
    };
    if args.dump_binary {
        // dumping needs the full partition resident
        options.memsave = MemoryMode::Off;
    }
    if args.rank >= args.num_ranks.max(1) {
        bail!("rank {} out of range for {} ranks", args.rank, args.num_ranks);
    }
    Ok(options)
}

fn run(args: Args) -> anyhow::Result<()> {
    let options = build_options(&args)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads())
        .build_global()
        .ok();

    // the reference: either a precomputed binary, or newick + MSA
    let (reference, leftover_queries) = if let Some(bin_file) = &args.binary {
        log::info!("loading reference from binary: {}", bin_file.display());
        let tree = ReferenceTree::from_binary(bin_file, &options)
            .context("failed to load binary reference")?;
        (tree, None)
    } else {
        let tree_file = args
            .tree
            .as_ref()
            .context("missing reference tree (-t) or binary (-b)")?;
        let msa_file = args
            .ref_msa
            .as_ref()
            .context("missing reference MSA (-s)")?;

        let mut ref_msa = fasta::build_msa_from_file(msa_file)
            .context("failed to read reference MSA")?;
        let model = SubstModel::new(&args.model, args.rate_cats)?;

        // footprint estimate decides whether the memory saver engages
        let ref_info = MsaInfo::from_msa(&ref_msa);
        let qry_info = match &args.query {
            Some(q) if epa::io::bfast::is_bfast(q) => epa::io::bfast::get_info(q)?,
            Some(q) => fasta::msa_info_from_file(q)?,
            None => ref_info.clone(),
        };
        let saver = MemorySaver::new(&ref_info, &qry_info, &model, &options)?;
        if saver.is_active() {
            log::info!("memory saver engaged");
        }

        let (mut tree, queries) = ReferenceTree::from_files(
            tree_file,
            &mut ref_msa,
            model,
            &options,
            saver.config,
        )?;

        if args.opt_ref {
            log::info!("optimizing model parameters and branch lengths");
            let logl = tree.optimize_model_and_branches()?;
            log::info!("optimized reference log-likelihood: {logl}");
        }
        (tree, (!queries.is_empty()).then_some(queries))
    };

    if args.dump_binary {
        let out = args.out_dir.join("epa_binary");
        log::info!("dumping reference to {}", out.display());
        BinaryStore::dump(&reference.tree, &reference.partition(), &out)?;
        return Ok(());
    }

    // the queries: a separate file, or whatever the combined MSA left over
    let mut reader: Box<dyn MsaReader> = match &args.query {
        Some(query_file) => stream::make_msa_reader(
            query_file,
            options.premasking,
            !args.no_prefetch,
            options.num_ranks,
            options.rank,
        )?,
        None => {
            let queries = leftover_queries
                .context("no query sequences: provide -q or a combined reference MSA")?;
            Box::new(InMemoryReader::new(queries))
        }
    };

    epa::place::process(Arc::new(reference), reader.as_mut(), &options)?;
    Ok(())
}
