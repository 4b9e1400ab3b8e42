//! Metabase operations, split by concern over one shared [`metabase::Metabase`].

pub mod chore;
pub mod metabase;
pub mod objects;
pub mod purge;
pub mod segments;
pub mod verify;

pub use chore::{PurgeChore, PurgeChoreConfig};
pub use metabase::{Metabase, MetabaseConfig};
pub use objects::{BeginObjectExactVersion, CommitObject, DeletedObject};
pub use purge::{DeleteExpiredObjects, DeleteZombieObjects, PurgeReport};
pub use segments::{BeginSegment, CommitSegment};
