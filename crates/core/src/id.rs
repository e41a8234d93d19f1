//! Strongly-typed identifiers for the entities the engine tracks.
//!
//! Each id is a [`domain-key`](https://crates.io/crates/domain-key) `Uuid<D>`
//! wrapper with its own domain marker, so a [`NodeId`] cannot be passed where
//! a [`GraphId`] is expected. A node id is stable across runs; a [`ProcessId`]
//! is minted per node invocation, so one node produces a fresh process id for
//! every loop iteration and split branch.
//!
//! All of them are `Copy` (a bare 16-byte UUID), serialize as the UUID string,
//! and expose `v4()`, `nil()`, `parse(&str)`, `Display`, `FromStr`, `Eq`,
//! `Ord`, and `Hash`.

use domain_key::define_uuid;

// Re-export for downstream parse error handling
pub use domain_key::UuidParseError;

define_uuid!(pub GraphIdDomain => GraphId);
define_uuid!(pub NodeIdDomain => NodeId);
define_uuid!(pub ProcessIdDomain => ProcessId);
define_uuid!(pub RecordingIdDomain => RecordingId);

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn v4_ids_are_non_nil_and_distinct() {
        assert!(!GraphId::v4().is_nil());
        assert!(!RecordingId::v4().is_nil());
        assert_ne!(NodeId::v4(), NodeId::v4());
        assert_ne!(ProcessId::v4(), ProcessId::v4());
    }

    #[test]
    fn nil_id_renders_as_zero_uuid() {
        let id = NodeId::nil();
        assert!(id.is_nil());
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn parse_and_display_roundtrip() {
        let id = NodeId::parse(SAMPLE).unwrap();
        assert_eq!(id.to_string(), SAMPLE);
        assert!(NodeId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn raw_uuid_and_bytes_roundtrip() {
        let raw = uuid::Uuid::new_v4();
        let typed = ProcessId::from(raw);
        assert_eq!(typed.get(), raw);

        let bytes = [42u8; 16];
        assert_eq!(NodeId::from_bytes(bytes).as_bytes(), &bytes);
    }

    #[test]
    fn serializes_as_plain_uuid_string() {
        let id = GraphId::parse(SAMPLE).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{SAMPLE}\""));
        assert_eq!(serde_json::from_str::<GraphId>(&json).unwrap(), id);
    }

    #[test]
    fn domain_names_the_wrapper_type() {
        assert_eq!(GraphId::nil().domain(), "GraphId");
        assert_eq!(ProcessId::nil().domain(), "ProcessId");
    }

    #[test]
    fn ids_order_and_hash_by_uuid_value() {
        use std::collections::HashSet;

        assert!(NodeId::nil() < NodeId::parse(SAMPLE).unwrap());

        let id = ProcessId::v4();
        let set: HashSet<ProcessId> = [id].into();
        assert!(set.contains(&id));
    }
}
