//! Identity of a single object version and of the storage stream behind it.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Full addressable identity of one object version.
///
/// `(project_id, bucket_name, object_key, version)` is unique across the
/// metabase. `stream_id` is minted once when the object is begun and never
/// changes, so segments reference it instead of the mutable key path.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectStream {
    /// Project owning the bucket.
    pub project_id: Uuid,

    /// Bucket name within the project.
    pub bucket_name: String,

    /// Encrypted object key (path inside the bucket).
    pub object_key: String,

    /// Exact version number, strictly positive.
    pub version: i64,

    /// Random identifier of the storage stream.
    pub stream_id: Uuid,
}

impl ObjectStream {
    /// Location of this stream, dropping the stream identifier.
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            object_key: self.object_key.clone(),
        }
    }

    pub fn version_location(&self) -> ObjectVersionLocation {
        self.location().with_version(self.version)
    }
}

impl fmt::Display for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{} (stream {})",
            self.project_id, self.bucket_name, self.object_key, self.version, self.stream_id
        )
    }
}

/// Object key path without a version, used by all-versions operations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: String,
}

impl ObjectLocation {
    /// Pin this location to an exact version.
    pub fn with_version(&self, version: i64) -> ObjectVersionLocation {
        ObjectVersionLocation {
            location: self.clone(),
            version,
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_id, self.bucket_name, self.object_key)
    }
}

/// Object key path pinned to one exact version.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectVersionLocation {
    pub location: ObjectLocation,
    pub version: i64,
}

impl fmt::Display for ObjectVersionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.location, self.version)
    }
}
