pub mod notes;
pub mod sample;
pub mod scene;
pub mod tiers;

pub use notes::{Knowledge, Todo};
pub use sample::{CaptureFrame, RawSample, SampleKind};
pub use scene::Scene;
pub use tiers::{Action, Activity, Event};
