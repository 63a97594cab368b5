//! Object storage and transient artifact handling.

mod artifacts;
mod store;

pub use artifacts::{ArtifactKind, ArtifactRegistry, CleanupReport};
pub use store::{is_remote, parse_object_uri, ObjectStorage, ObjectUri};
