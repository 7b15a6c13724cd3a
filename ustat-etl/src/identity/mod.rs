mod graph;
mod hierarchy;
mod store;

pub use hierarchy::{HierarchyResolver, IdentityRefs};
pub use store::{IdentityRecord, IdentityStore};
