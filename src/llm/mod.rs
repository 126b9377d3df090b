pub mod breaker;
pub mod retry;
pub mod router;

pub use breaker::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;
pub use router::LlmClient;
