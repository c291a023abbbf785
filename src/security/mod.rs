pub mod policy;
pub mod scan;

pub use policy::{CapabilityPolicy, PolicyError, RestrictedRuntime};
pub use scan::{check_snippet, Violation, ViolationKind};
