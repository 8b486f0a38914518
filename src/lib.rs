pub mod engine;
pub mod error;
pub mod io;
pub mod memory;
pub mod options;
pub mod place;
pub mod sample;
pub mod tree;

/// dimensional analysis types
pub type BranchId = usize;
pub type SeqId = usize;
pub type Logl = f64;
pub type Lwr = f64;

// branch length parameters
pub const DEFAULT_BRANCH_LENGTH: f64 = 0.000001;
pub const MIN_BRANCH_LENGTH: f64 = 1e-8;
pub const MAX_BRANCH_LENGTH: f64 = 100.0;

// convergence parameters
pub const OPT_EPSILON: f64 = 1.0;
pub const OPT_PARAM_EPSILON: f64 = 1e-4;
pub const OPT_BRANCH_EPSILON: f64 = 1e-4;
pub const MAX_NEWTON_ITERS: usize = 30;

// numerical scaling parameters
pub const SCALE_FACTOR: f64 = 1.152921504606847e18; // 2^60
pub const SCALE_THRESHOLD: f64 = 1.0 / SCALE_FACTOR;

// pipeline parameters
pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_FILTER_MIN: usize = 1;
pub const DEFAULT_FILTER_MAX: usize = 7;
pub const DEFAULT_SUPPORT_THRESHOLD: f64 = 0.01;
pub const DEFAULT_PRESCORING_THRESHOLD: f64 = 0.99999;

// baseball heuristic parameters
pub const STRIKE_BOX: f64 = 3.0;
pub const MAX_STRIKES: usize = 6;
pub const MAX_PITCHES: usize = 40;

// memory saver parameters
pub const DEFAULT_CONCURRENT_BRANCHES: usize = 4;

/// trait for random generation, mainly (strictly?) for testing
pub trait Arbitrary {
    fn random() -> Self;
}

/// progress bar
pub fn progress(n: usize) -> indicatif::ProgressBar {
    let tick = std::time::Duration::from_secs(60);
    let style = "{spinner:.cyan} {elapsed} ~ {percent:>3}% {wide_bar:.cyan}";
    let style = indicatif::ProgressStyle::with_template(style).unwrap();
    let progress = indicatif::ProgressBar::new(n as u64);
    progress.set_style(style);
    progress.enable_steady_tick(tick);
    progress
}

/// initialize logging; terminal plus a log file in the output directory
pub fn init(out_dir: &std::path::Path) {
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(out_dir.join("epa_info.log")).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        log::LevelFilter::Info,
        config.clone(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("initialize logger");
}
