//! Convert a text fasta file of DNA query sequences into the 4-bit packed
//! binary format, which enables random access and rank sharding.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "convert", version, about = "Convert fasta to 4-bit binary fasta")]
struct Args {
    /// text fasta file to convert
    fasta: PathBuf,

    /// output directory
    #[arg(short = 'w', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,
}

fn main() {
    let args = Args::parse();
    std::fs::create_dir_all(&args.out_dir).expect("create output directory");
    epa::init(&args.out_dir);

    match epa::io::bfast::fasta_to_bfast(&args.fasta, &args.out_dir) {
        Ok(path) => log::info!("wrote {}", path.display()),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
