// Stall monitoring for the non-blocking runtime workers
//
// `sampler` defines the introspection seam, `procfs` implements it for Linux
// tokio workers, and `detector` runs the per-worker episode state machine.

pub mod detector;
pub mod procfs;
pub mod sampler;

pub use detector::{AlertLevel, MonitorStatus, StallAlert, StallDetector, StallStats, WorkerInfo};
pub use procfs::{ParkRegistry, ParkState, ProcfsSampler};
pub use sampler::{NamePatterns, WaitState, WorkerSampler, WorkerSnapshot};
