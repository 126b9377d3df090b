pub mod detector;
pub mod sse;

pub use detector::FieldDetector;
pub use sse::SseParser;
