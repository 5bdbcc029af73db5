pub mod decoder;
pub mod record;

pub use decoder::{DecodedLine, LineDecoder, LineSplitter, RawLine};
pub use record::{LogLine, LogSource, TelemetryRecord};
