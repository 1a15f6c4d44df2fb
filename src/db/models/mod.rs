mod batch;
mod card;
mod segment;

pub use batch::{Batch, BatchStatus, Observation};
pub use card::{ActivityCard, AppUsage, Distraction, NewCard};
pub use segment::{NewSegment, Segment, SegmentStatus};
