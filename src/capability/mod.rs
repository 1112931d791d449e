// Warden - Capability Module
//
// Capability lifecycle: a request becomes a grant (or a denial), a grant
// is valid while `now < expires_at`, and revocation is terminal. The
// `CapabilityEngine` trait is the seam the gateway talks to; the
// in-memory engine signs every grant with Ed25519.

mod constraints;
mod engine;
mod error;
mod models;

pub use constraints::{CapabilityConstraints, TimeRange, TimeWindow, SOURCE_IP_KEY};
pub use engine::{CapabilityEngine, EngineConfig, MemoryCapabilityEngine};
pub use error::CapabilityError;
pub use models::{
    parse_ttl, CapabilityFilter, CapabilityRequest, CapabilityState, CapabilityType,
    GrantOutcome, GrantedCapability, InvalidReason, RevocationInfo, ValidationResult,
};
