//! Segment/sequence assembly engine.
//!
//! Segments are buffered individually, merged into per-sequence files as they
//! complete, and concatenated into the output by [`FormatWriter::finish`].

pub mod segment;
pub mod sequence;
pub mod state;
mod writer;

pub use segment::{INIT_SEGMENT_ID, Segment, SegmentFile};
pub use sequence::{Sequence, SequenceFile};
pub use state::{AssemblyState, StateFile};
pub use writer::{FormatState, FormatWriter, SegmentData, SegmentEnd, SegmentInit};
