//! Consensus-wide constants shared across validation.

/// Target spacing between blocks, in milliseconds.
pub const BLOCK_TARGET_SPACING_MS: u64 = 10_000;
/// Difficulty is re-evaluated once per this many blocks.
pub const RETARGET_INTERVAL: u64 = 10;
/// Base coinbase subsidy, in sats.
pub const BASE_SUBSIDY: u64 = 5_000_000_000;
/// The subsidy halves every this many blocks.
pub const SUBSIDY_HALVING_INTERVAL: u64 = 210_000;
/// Median-time-past window, inclusive of the block under validation.
pub const MTP_WINDOW: u64 = 11;
/// Maximum allowed block timestamp drift into the future, in milliseconds.
pub const MAX_FUTURE_DRIFT_MS: u64 = 120_000;
/// Minimum fee rate, in sats per serialized transaction byte.
pub const MIN_FEE_RATE: u64 = 1;
/// Default cap on total serialized transaction bytes per block (network rule).
pub const DEFAULT_MAX_BLOCK_DATA_BYTES: usize = 10_240;
/// The lowest difficulty a retarget may reach (leading zero bits).
pub const MIN_DIFFICULTY: u8 = 1;
