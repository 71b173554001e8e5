//! Signal processing stages applied to raw segments.
//!
//! Everything here is a pure function of in-memory sample matrices; reading
//! and writing artifacts is the pipeline's job.

pub mod activity;
pub mod bandpass;
pub mod detect;
pub mod shift;
pub mod stats;

pub use activity::{detect_high_activity, HighActivity, Interval};
pub use bandpass::{bandpass_filter, Biquad, SosFilter};
pub use detect::detect_spikes;
pub use shift::{apply_time_shifts, optimize_time_shift, ShiftCoefficients};
pub use stats::{compute_channel_spike_stats, ChannelSpikeStats};
