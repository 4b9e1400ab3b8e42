//! Fixtures and the store verification harness shared by unit tests.

use crate::db::{DatabaseCollection, DbOptions};
use crate::models::{
    CipherSuite, EncryptionParameters, NodeId, Object, ObjectStream, Piece, PieceId, Pieces,
    Redundancy, RedundancyAlgorithm, Segment, SegmentPosition,
};
use crate::services::{
    BeginObjectExactVersion, BeginSegment, CommitObject, CommitSegment, Metabase, MetabaseConfig,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_ENCRYPTION: EncryptionParameters = EncryptionParameters {
    cipher_suite: CipherSuite::AesGcm,
    block_size: 29 * 256,
};

pub const DEFAULT_REDUNDANCY: Redundancy = Redundancy {
    algorithm: RedundancyAlgorithm::ReedSolomon,
    share_size: 2048,
    required_shares: 1,
    repair_shares: 1,
    optimal_shares: 1,
    total_shares: 1,
};

pub async fn test_metabase() -> Arc<Metabase> {
    test_metabase_with(MetabaseConfig::default()).await
}

/// Fresh in-memory store with the schema applied.
pub async fn test_metabase_with(config: MetabaseConfig) -> Arc<Metabase> {
    open_metabase("sqlite::memory:", config).await
}

/// Named in-memory database in shared-cache mode. Every pool opened on the
/// same url sees the same tables, with SQLite table locks between them.
pub fn shared_memory_url() -> String {
    format!(
        "sqlite:file:metabase-{}?mode=memory&cache=shared",
        Uuid::new_v4().simple()
    )
}

/// Open `url` as its own collection and apply the schema.
pub async fn open_metabase(url: &str, config: MetabaseConfig) -> Arc<Metabase> {
    let opts = DbOptions {
        metabase: config,
        ..DbOptions::default()
    };
    let dbs = DatabaseCollection::open(url, opts)
        .await
        .expect("failed to open in-memory store");
    dbs.migrate_to_latest().await.expect("failed to migrate");
    dbs.metabase()
}

pub fn rand_object_stream() -> ObjectStream {
    ObjectStream {
        project_id: Uuid::new_v4(),
        bucket_name: format!("bucket-{}", Uuid::new_v4().simple()),
        object_key: format!("key/{}", Uuid::new_v4().simple()),
        version: 1,
        stream_id: Uuid::new_v4(),
    }
}

/// 32-byte id whose first byte is `first`, like `NodeID{2}`.
fn id_bytes(first: u8) -> [u8; 32] {
    let mut bytes = [0; 32];
    bytes[0] = first;
    bytes
}

pub fn node_id(first: u8) -> NodeId {
    NodeId(id_bytes(first))
}

pub fn piece_id(first: u8) -> PieceId {
    PieceId(id_bytes(first))
}

pub fn rand_node_id() -> NodeId {
    let mut bytes = [0; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    NodeId(bytes)
}

pub fn default_pieces() -> Pieces {
    Pieces::new(vec![Piece {
        number: 0,
        storage_node: node_id(2),
    }])
}

pub fn begin_opts(stream: &ObjectStream) -> BeginObjectExactVersion {
    BeginObjectExactVersion {
        object_stream: stream.clone(),
        encryption: DEFAULT_ENCRYPTION,
        expires_at: None,
        zombie_deletion_deadline: None,
    }
}

pub fn begin_segment_opts(stream: &ObjectStream, position: SegmentPosition) -> BeginSegment {
    BeginSegment {
        object_stream: stream.clone(),
        position,
        root_piece_id: piece_id(1),
        pieces: Pieces::new(vec![Piece {
            number: 1,
            storage_node: rand_node_id(),
        }]),
    }
}

pub fn commit_segment_opts(
    stream: &ObjectStream,
    position: SegmentPosition,
    plain_offset: i64,
) -> CommitSegment {
    CommitSegment {
        object_stream: stream.clone(),
        position,
        root_piece_id: piece_id(1),
        pieces: default_pieces(),
        encrypted_key_nonce: vec![4],
        encrypted_key: vec![3],
        encrypted_etag: vec![5],
        encrypted_size: 1060,
        plain_size: 512,
        plain_offset,
        redundancy: DEFAULT_REDUNDANCY,
    }
}

/// Begin, upload `segments` segments in part 0 and commit an object.
pub async fn create_test_object(
    metabase: &Metabase,
    begin: BeginObjectExactVersion,
    segments: u32,
) -> (Object, Vec<Segment>) {
    let stream = begin.object_stream.clone();
    metabase
        .begin_object_exact_version(begin)
        .await
        .expect("begin object");

    let mut committed = Vec::new();
    for index in 0..segments {
        let position = SegmentPosition::new(0, index);
        metabase
            .begin_segment(begin_segment_opts(&stream, position))
            .await
            .expect("begin segment");
        let segment = metabase
            .commit_segment(commit_segment_opts(&stream, position, i64::from(index) * 512))
            .await
            .expect("commit segment");
        committed.push(segment);
    }

    let object = metabase
        .commit_object(CommitObject {
            object_stream: stream,
            ..CommitObject::default()
        })
        .await
        .expect("commit object");
    (object, committed)
}

/// Committed object with `segments` segments that expires at `expires_at`.
pub async fn create_expired_object(
    metabase: &Metabase,
    stream: ObjectStream,
    segments: u32,
    expires_at: DateTime<Utc>,
) -> (Object, Vec<Segment>) {
    let begin = BeginObjectExactVersion {
        expires_at: Some(expires_at),
        ..begin_opts(&stream)
    };
    create_test_object(metabase, begin, segments).await
}

/// Asserts the store holds exactly `objects` and `segments`, compared field
/// by field, and that no segment is orphaned.
#[derive(Debug, Default)]
pub struct Verify {
    pub objects: Vec<Object>,
    pub segments: Vec<Segment>,
}

impl Verify {
    pub async fn check(self, metabase: &Metabase) {
        let mut expected_objects = self.objects;
        let mut expected_segments = self.segments;
        let mut actual_objects = metabase.testing_all_objects().await.expect("all objects");
        let mut actual_segments = metabase.testing_all_segments().await.expect("all segments");

        for objects in [&mut expected_objects, &mut actual_objects] {
            objects.sort_by(|a, b| {
                let key = |o: &Object| {
                    (
                        o.stream.project_id,
                        o.stream.bucket_name.clone(),
                        o.stream.object_key.clone(),
                        o.stream.version,
                    )
                };
                key(a).cmp(&key(b))
            });
        }
        for segments in [&mut expected_segments, &mut actual_segments] {
            segments.sort_by_key(|s| (s.stream_id, s.position));
        }

        for (expected, actual) in expected_objects.iter().zip(actual_objects.iter_mut()) {
            actual.created_at = aligned(expected.created_at, actual.created_at);
            align_optional(expected.expires_at, &mut actual.expires_at);
            align_optional(
                expected.zombie_deletion_deadline,
                &mut actual.zombie_deletion_deadline,
            );
        }
        for (expected, actual) in expected_segments.iter().zip(actual_segments.iter_mut()) {
            actual.created_at = aligned(expected.created_at, actual.created_at);
            align_optional(expected.expires_at, &mut actual.expires_at);
        }

        assert_eq!(expected_objects, actual_objects, "objects differ");
        assert_eq!(expected_segments, actual_segments, "segments differ");

        metabase
            .check_referential_integrity()
            .await
            .expect("referential integrity");
    }
}

/// Timestamps written by the store within a few seconds of the expected
/// value compare equal.
fn aligned(expected: DateTime<Utc>, actual: DateTime<Utc>) -> DateTime<Utc> {
    if (expected - actual).abs() <= Duration::seconds(5) {
        expected
    } else {
        actual
    }
}

fn align_optional(expected: Option<DateTime<Utc>>, actual: &mut Option<DateTime<Utc>>) {
    if let (Some(e), Some(a)) = (expected, *actual) {
        *actual = Some(aligned(e, a));
    }
}
