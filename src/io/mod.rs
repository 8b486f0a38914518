pub mod bfast;
pub mod binary;
pub mod fasta;
pub mod jplace;
pub mod msa;
pub mod stream;
