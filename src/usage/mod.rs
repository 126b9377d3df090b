pub mod tracker;

pub use tracker::CostTracker;

/// Identity of the request on whose behalf LLM work runs. Created once
/// at request entry and passed down; nothing here is global.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub session_id: Option<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
        }
    }
}
