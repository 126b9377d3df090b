pub mod context;
pub mod result;
pub mod service;

pub use context::AugmentationContext;
pub use result::{
    Candidate, Escalation, EscalationStep, IdentificationOutcome, IdentifyAction,
    WineIdentification,
};
pub use service::{IdentificationService, IdentifyInput};
