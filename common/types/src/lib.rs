mod batch;

pub use batch::EventBatch;
pub use batch::TelemetryRecord;
