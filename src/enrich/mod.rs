pub mod canonical;
pub mod record;
pub mod service;

pub use canonical::{canonical, canonical_key, CanonicalKey};
pub use record::EnrichmentRecord;
pub use service::{EnrichOutcome, EnrichRequest, EnrichmentService};
