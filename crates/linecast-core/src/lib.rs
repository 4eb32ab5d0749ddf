// crates/linecast-core/src/lib.rs

pub mod boundary;
pub mod clock;
pub mod config;
pub mod frame;
pub mod plan;
pub mod timeline;
pub mod violation;

pub use boundary::{BoundaryError, BoundaryPhase, BoundaryRecord};
pub use clock::{ManualClock, MasterClock, SystemClock};
pub use config::Tunables;
pub use frame::{AudioPayload, FrameKind, MediaItem, OutputFrame, VideoPayload};
pub use plan::{Fps, PlanError, PlannedSegment, SegmentId, SegmentSourceSpec};
pub use timeline::{ContentClock, Stamp};
pub use violation::{Violation, ViolationClass};
