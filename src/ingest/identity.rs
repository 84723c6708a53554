//! Deterministic node identity
//!
//! Node uuids are UUID v5 over `(project, path, label, identity key)`, so
//! parsing the same content twice, from any process, yields the same uuids.

use uuid::Uuid;

/// Namespace for every uuid this crate derives.
const NAMESPACE: Uuid = Uuid::from_u128(0x6b6e_6f77_6c65_4467_8000_7379_6e63_0001);

/// Uuid of a file's `SourceFile` node.
pub fn file_node_uuid(project_id: &str, path: &str) -> Uuid {
    Uuid::new_v5(&NAMESPACE, format!("{}\0file\0{}", project_id, path).as_bytes())
}

/// Uuid of a node derived from a file. `key` must be unique per label within
/// the file (for example a qualified name or a section ordinal).
pub fn node_uuid(project_id: &str, path: &str, label: &str, key: &str) -> Uuid {
    Uuid::new_v5(
        &NAMESPACE,
        format!("{}\0{}\0{}\0{}", project_id, path, label, key).as_bytes(),
    )
}

/// Turn a path relative to a project root into the `/`-separated form
/// stored on records and nodes.
pub fn normalize_relative_path(path: &std::path::Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_node_uuid_is_deterministic() {
        let a = node_uuid("p", "src/a.rs", "Function", "foo");
        let b = node_uuid("p", "src/a.rs", "Function", "foo");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_node_uuid_separates_components() {
        let base = node_uuid("p", "a", "Function", "foo");
        assert_ne!(base, node_uuid("q", "a", "Function", "foo"));
        assert_ne!(base, node_uuid("p", "b", "Function", "foo"));
        assert_ne!(base, node_uuid("p", "a", "Method", "foo"));
        assert_ne!(base, node_uuid("p", "a", "Function", "bar"));
        // No ambiguity from concatenation
        assert_ne!(node_uuid("p", "ab", "L", "c"), node_uuid("p", "a", "bL", "c"));
    }

    #[test]
    fn test_file_uuid_differs_from_node_uuids() {
        assert_ne!(file_node_uuid("p", "a"), node_uuid("p", "a", "File", ""));
    }

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path(Path::new("./src/lib.rs")), "src/lib.rs");
        assert_eq!(normalize_relative_path(Path::new("docs/a b.md")), "docs/a b.md");
    }
}
