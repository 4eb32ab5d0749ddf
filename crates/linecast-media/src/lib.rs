// crates/linecast-media/src/lib.rs

pub mod decode;
pub mod fps;
pub mod pad;
pub mod producer;
#[cfg(feature = "sim")]
pub mod sim;

pub use fps::{Cadence, Resample};
pub use pad::PadSource;
pub use producer::{EofReport, FileProducer, FrameSource, ProducerEvent, SegmentFeed};
