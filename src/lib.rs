// Public modules
pub mod boost;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod hotplug;
pub mod sampler;
pub mod store;
pub mod tunables;

// Re-export constants commonly used
pub mod constants {
    // Frequency governor defaults (percent unless noted)
    pub const DEF_HIGHSPEED_UP_THRESHOLD: u32 = 85;
    pub const DEF_UP_THRESHOLD: u32 = 80;
    pub const DEF_MICRO_UP_THRESHOLD: u32 = 70;
    pub const DEF_DOWN_THRESHOLD: u32 = 25;
    pub const DEF_MICRO_DOWN_THRESHOLD: u32 = 40;
    pub const MIN_DOWN_THRESHOLD: u32 = 11;
    pub const DEF_FREQ_STEP: u32 = 8;
    pub const DEF_MICRO_FREQ_STEP: u32 = 3;
    pub const MAX_MICRO_FREQ_STEP: u32 = 10;
    pub const DEF_SAMPLING_DOWN_FACTOR: u32 = 1;
    pub const MAX_SAMPLING_DOWN_FACTOR: u32 = 10;
    // kHz
    pub const DEF_HIGHSPEED_FREQ: u32 = 1_734_000;

    // Touch boost
    // kHz
    pub const DEF_INPUT_EVENT_MIN_FREQ: u32 = 1_036_800;
    // ms
    pub const DEF_INPUT_EVENT_DURATION_MS: u32 = 1_000;
    pub const MAX_INPUT_EVENT_DURATION_MS: u32 = 5_000;

    // Proportional stepping
    pub const DEF_PROPORTIONAL_RESISTANCE: u32 = 150;
    pub const DEF_PROPORTIONAL_DOWN_BIAS: u32 = 10;

    // Sampling rate derivation
    pub const MIN_SAMPLING_RATE_RATIO: u32 = 2;
    pub const MIN_SAMPLING_RATE_TICKS: u32 = 10;
    pub const LATENCY_MULTIPLIER: u32 = 1_000;
    pub const DEF_PLATFORM_HZ: u32 = 1_000;

    // Core-count governor (ms)
    pub const DEF_UP_DELAY_MS: u64 = 50;
    pub const DEF_DOWN_DELAY_MS: u64 = 1_000;
    pub const DEF_LOAD_SAMPLE_MS: u64 = 20;
    pub const LOAD_TIMER_FIRST_DELAY_MS: u64 = 100;
    pub const DEF_CORE_BOOST_DURATION_MS: u64 = 1_000;
    pub const DEF_BALANCE_LEVEL: u32 = 25;
    pub const RESERVED_CPU: usize = 0;

    // Policy limits are re-read every this many ticks of a unit
    pub const LIMITS_REFRESH_TICKS: u32 = 50;

    // Logging
    pub const DEF_TRANSITION_LOG_INTERVAL_SECS: u64 = 1;
    pub const SAMPLE_ERROR_LOG_INTERVAL_SECS: u64 = 10;
}
