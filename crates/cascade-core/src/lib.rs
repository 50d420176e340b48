pub mod domain;
pub mod frontmatter;
pub mod types;

pub use domain::hierarchy::{is_valid_edge, permitted_parents};
pub use domain::progress::{
    derive_aggregate, derive_parent_status, leaf_percentage, promote_if_complete,
    update_child_summary,
};
pub use domain::slug::slugify;
pub use frontmatter::{Frontmatter, FrontmatterError};
pub use types::{
    AggregateRecord, ChildSummary, Complexity, NodeId, NodeKind, Priority, ProgressMetrics,
    Registry, RegistryEntry, Status,
};
