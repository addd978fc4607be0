//! Persistence: measurement records, recording outputs and imaging snapshots.

pub mod records;
pub mod snapshot;
pub mod video;

pub use records::{open_store, CsvRecordStore, JsonLinesRecordStore, MemoryRecordStore, SampleRecordStore};
pub use snapshot::SnapshotWriter;
pub use video::{FileSinkFactory, FrameSink, FrameSinkFactory, SessionMetadata, SessionStatus};
