//! Opportunity triage and execution-request forwarding.

pub mod opportunity;
pub mod router;

pub use opportunity::{Opportunity, OpportunityStatus};
pub use router::{IngestOutcome, OpportunityRouter, RouterConfig};
