//! Test helper factories
//!
//! Graph node builders with sensible defaults and a configuration with short
//! timings for tests that run the full pipeline.
#![allow(dead_code)]

use crate::neo4j::models::{props, GraphNode};
use crate::Config;
use uuid::Uuid;

/// A node with a random uuid, a label and a `name` in project `p`
pub fn test_node(label: &str, name: &str) -> GraphNode {
    GraphNode::new(Uuid::new_v4(), label, "p").with_property(props::NAME, name)
}

/// A `Section` node starting at line 1 that still needs embeddings
pub fn test_section(project: &str, path: &str, name: &str, content: &str) -> GraphNode {
    GraphNode::new(Uuid::new_v4(), "Section", project)
        .with_property(props::FILE_PATH, path)
        .with_property(props::NAME, name)
        .with_property(props::CONTENT, content)
        .with_property(props::START_LINE, 1u64)
        .with_property(props::EMBEDDINGS_DIRTY, true)
}

/// Defaults with millisecond debounce and lock polling
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ingestion.debounce_ms = 20;
    config.locks.wait_timeout_ms = 2_000;
    config.locks.poll_interval_ms = 5;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_defaults() {
        let node = test_section("p", "a.md", "intro", "hello");
        assert_eq!(node.label, "Section");
        assert_eq!(node.project_id, "p");
        assert_eq!(node.properties[props::START_LINE], 1);
        assert_eq!(node.properties[props::EMBEDDINGS_DIRTY], true);
    }

    #[test]
    fn test_config_is_fast() {
        let config = test_config();
        assert!(config.ingestion.debounce_ms < 100);
        assert!(config.locks.poll_interval_ms < 10);
    }
}
