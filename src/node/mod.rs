//! Store node registry, availability tracking and selection.

pub mod availability;
pub mod registry;
pub mod selector;

pub use availability::{NodeAvailabilityCache, NodeProber};
pub use registry::NodeRegistry;
pub use selector::NodeSelector;
