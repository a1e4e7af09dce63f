//! `scribeflow-core` — shared building blocks for the orchestration layer.
//!
//! Identifiers, transcript values, the engine failure type and the clock
//! abstraction. No locking and no IO.

pub mod clock;
pub mod error;
pub mod id;
pub mod transcript;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, InferenceError};
pub use id::{JobId, ResourceClass, ResourceId, TaskId};
pub use transcript::{Segment, TranscriptionResult};
