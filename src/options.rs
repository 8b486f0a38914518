use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericalScaling {
    On,
    Off,
    Auto,
}

/// memory saver activation mode. Off keeps one CLV per direction per inner
/// node resident; Full shrinks to the theoretical minimum; Auto only kicks
/// in when the footprint estimate exceeds the constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    #[default]
    Off,
    Full,
    Auto,
}

/// runtime knobs of a placement run. defaults mirror the CLI defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub prescoring: bool,
    pub prescoring_by_percentage: bool,
    pub prescoring_threshold: f64,
    pub baseball: bool,

    pub opt_model: bool,
    pub opt_branches: bool,
    pub sliding_blo: bool,

    pub support_threshold: f64,
    pub acc_threshold: bool,
    pub filter_min: usize,
    pub filter_max: usize,

    pub premasking: bool,
    pub empirical_freqs: bool,

    pub chunk_size: usize,
    pub num_threads: usize,
    pub scaling: NumericalScaling,

    pub memsave: MemoryMode,
    pub max_memory: Option<String>,
    pub concurrent_branches: usize,

    /// logical rank layer: this process handles shard `rank` of `num_ranks`
    pub num_ranks: usize,
    pub rank: usize,

    pub out_dir: PathBuf,
    pub invocation: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prescoring: true,
            prescoring_by_percentage: false,
            prescoring_threshold: crate::DEFAULT_PRESCORING_THRESHOLD,
            baseball: false,
            opt_model: false,
            opt_branches: false,
            sliding_blo: true,
            support_threshold: crate::DEFAULT_SUPPORT_THRESHOLD,
            acc_threshold: false,
            filter_min: crate::DEFAULT_FILTER_MIN,
            filter_max: crate::DEFAULT_FILTER_MAX,
            premasking: true,
            empirical_freqs: false,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            num_threads: 0,
            scaling: NumericalScaling::Auto,
            memsave: MemoryMode::Off,
            max_memory: None,
            concurrent_branches: crate::DEFAULT_CONCURRENT_BRANCHES,
            num_ranks: 1,
            rank: 0,
            out_dir: PathBuf::from("."),
            invocation: String::new(),
        }
    }
}

impl Options {
    /// effective number of worker threads
    pub fn threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get()
        } else {
            self.num_threads
        }
    }
}
