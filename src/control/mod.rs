// Control plane: admission control for the request path
//
// `window` keeps per-second completion counts, `shedder` turns them into a
// shedding decision with hysteresis, and `layer` applies that decision to
// incoming HTTP requests.

pub mod layer;
pub mod shedder;
pub mod window;

pub use layer::{AdmissionLayer, CompletionGuard};
pub use shedder::{Admission, AdmissionController, CheckResult, ShedderStatus, Transition};
pub use window::SlidingWindow;
