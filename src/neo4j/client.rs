//! Neo4j client for the knowledge graph
//!
//! Every derived node carries the `Entity` label next to its schema label so
//! one uniqueness constraint on `uuid` covers all of them. File records are
//! `SourceFile` nodes; the ingestion pipeline links derived nodes to them with
//! `DEFINED_IN` edges.

use super::models::*;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use neo4rs::{query, BoltType, Graph, Query};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Client for Neo4j operations
pub struct Neo4jClient {
    graph: Arc<Graph>,
    vector_dimensions: usize,
}

/// Labels and relationship types are interpolated into Cypher, so they must
/// be plain identifiers.
fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        bail!("Invalid {} '{}': must be an alphanumeric identifier", kind, value);
    }
    Ok(())
}

/// Convert a JSON property value into something Neo4j can store on a node.
/// Nested objects and mixed lists are stored as JSON strings; nulls are
/// skipped so `SET n += props` leaves the old value in place.
fn json_to_bolt(value: &serde_json::Value) -> Option<BoltType> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some((*b).into()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.into()),
            None => n.as_f64().map(Into::into),
        },
        Value::String(s) => Some(s.clone().into()),
        Value::Array(items) => {
            if items.iter().all(|v| v.is_number()) {
                let floats: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
                Some(floats.into())
            } else if items.iter().all(|v| v.is_string()) {
                let strings: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                Some(strings.into())
            } else {
                Some(value.to_string().into())
            }
        }
        Value::Object(_) => Some(value.to_string().into()),
    }
}

fn properties_to_bolt(properties: &Properties) -> HashMap<String, BoltType> {
    properties
        .iter()
        .filter(|(k, _)| k.as_str() != props::UUID && k.as_str() != props::PROJECT_ID)
        .filter_map(|(k, v)| json_to_bolt(v).map(|b| (k.clone(), b)))
        .collect()
}

/// Read a stored property back as JSON. Neo4j only stores scalars and
/// homogeneous lists, so trying each in turn covers every case.
fn read_property<F>(get_json: F) -> Option<serde_json::Value>
where
    F: Fn(PropKind) -> Option<serde_json::Value>,
{
    [
        PropKind::Bool,
        PropKind::Int,
        PropKind::Float,
        PropKind::Str,
        PropKind::FloatList,
        PropKind::StrList,
    ]
    .into_iter()
    .find_map(get_json)
}

#[derive(Clone, Copy)]
enum PropKind {
    Bool,
    Int,
    Float,
    Str,
    FloatList,
    StrList,
}

fn node_property(node: &neo4rs::Node, key: &str) -> Option<serde_json::Value> {
    read_property(|kind| match kind {
        PropKind::Bool => node.get::<bool>(key).ok().map(Into::into),
        PropKind::Int => node.get::<i64>(key).ok().map(Into::into),
        PropKind::Float => node.get::<f64>(key).ok().map(Into::into),
        PropKind::Str => node.get::<String>(key).ok().map(Into::into),
        PropKind::FloatList => node.get::<Vec<f64>>(key).ok().map(Into::into),
        PropKind::StrList => node.get::<Vec<String>>(key).ok().map(Into::into),
    })
}

fn relation_property(rel: &neo4rs::Relation, key: &str) -> Option<serde_json::Value> {
    read_property(|kind| match kind {
        PropKind::Bool => rel.get::<bool>(key).ok().map(Into::into),
        PropKind::Int => rel.get::<i64>(key).ok().map(Into::into),
        PropKind::Float => rel.get::<f64>(key).ok().map(Into::into),
        PropKind::Str => rel.get::<String>(key).ok().map(Into::into),
        PropKind::FloatList => rel.get::<Vec<f64>>(key).ok().map(Into::into),
        PropKind::StrList => rel.get::<Vec<String>>(key).ok().map(Into::into),
    })
}

/// Cypher fragment and parameters for a [`NodeFilter`]. The glob is applied
/// afterwards in Rust.
fn filter_clause(alias: &str, filter: &NodeFilter) -> (String, Vec<(&'static str, BoltType)>) {
    let mut conditions = vec![format!("NOT {}:{}", alias, SOURCE_FILE_LABEL)];
    let mut params: Vec<(&'static str, BoltType)> = Vec::new();
    if !filter.project_ids.is_empty() {
        conditions.push(format!("{}.project_id IN $filter_projects", alias));
        params.push(("filter_projects", filter.project_ids.clone().into()));
    }
    if !filter.labels.is_empty() {
        conditions.push(format!(
            "any(l IN labels({}) WHERE l IN $filter_labels)",
            alias
        ));
        params.push(("filter_labels", filter.labels.clone().into()));
    }
    if let Some(base) = &filter.base_path {
        conditions.push(format!("{}.file_path STARTS WITH $filter_base", alias));
        params.push(("filter_base", base.trim_start_matches("./").to_string().into()));
    }
    (conditions.join(" AND "), params)
}

impl Neo4jClient {
    /// Create a new Neo4j client and make sure the schema exists
    pub async fn new(uri: &str, user: &str, password: &str, vector_dimensions: usize) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context("Failed to connect to Neo4j")?;

        let client = Self {
            graph: Arc::new(graph),
            vector_dimensions,
        };

        client.init_schema().await?;

        Ok(client)
    }

    /// Initialize the graph schema with constraints and indexes
    async fn init_schema(&self) -> Result<()> {
        let constraints = vec![
            "CREATE CONSTRAINT entity_uuid IF NOT EXISTS FOR (n:Entity) REQUIRE n.uuid IS UNIQUE",
            "CREATE CONSTRAINT ks_project_id IF NOT EXISTS FOR (p:Project) REQUIRE p.id IS UNIQUE",
        ];

        let indexes = vec![
            "CREATE INDEX entity_file IF NOT EXISTS FOR (n:Entity) ON (n.project_id, n.file_path)",
            "CREATE INDEX entity_embeddings_dirty IF NOT EXISTS FOR (n:Entity) ON (n.embeddings_dirty)",
            "CREATE INDEX source_file_state IF NOT EXISTS FOR (f:SourceFile) ON (f.state)",
        ];

        for constraint in constraints {
            if let Err(e) = self.graph.run(query(constraint)).await {
                tracing::warn!("Constraint may already exist: {}", e);
            }
        }

        for index in indexes {
            if let Err(e) = self.graph.run(query(index)).await {
                tracing::warn!("Index may already exist: {}", e);
            }
        }

        // Vector indexes need Neo4j 5.13+; without them semantic search fails
        // at query time but ingestion still works.
        for field in EmbeddingField::CONCRETE {
            let (Some(index), Some(prop)) = (field.index_name(), field.property_name()) else {
                continue;
            };
            let cypher = format!(
                "CREATE VECTOR INDEX {index} IF NOT EXISTS
                 FOR (n:Entity) ON (n.{prop})
                 OPTIONS {{indexConfig: {{
                     `vector.dimensions`: {dims},
                     `vector.similarity_function`: 'cosine'
                 }}}}",
                dims = self.vector_dimensions
            );
            if let Err(e) = self.graph.run(query(&cypher)).await {
                tracing::warn!("Vector index {} not created: {}", index, e);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    fn node_to_graph_node(&self, node: &neo4rs::Node) -> Result<GraphNode> {
        let uuid: Uuid = node.get::<String>(props::UUID)?.parse()?;
        let label = node
            .labels()
            .into_iter()
            .find(|l| *l != "Entity")
            .ok_or_else(|| anyhow!("Node {} has no schema label", uuid))?
            .to_string();
        let project_id: String = node.get(props::PROJECT_ID)?;

        let mut properties = Properties::new();
        for key in node.keys() {
            if key == props::UUID || key == props::PROJECT_ID || key.starts_with("embedding_") {
                continue;
            }
            if let Some(value) = node_property(node, key) {
                properties.insert(key.to_string(), value);
            }
        }

        Ok(GraphNode {
            uuid,
            label,
            project_id,
            properties,
        })
    }

    fn node_to_file_record(&self, node: &neo4rs::Node) -> Result<FileRecord> {
        Ok(FileRecord {
            project_id: node.get(props::PROJECT_ID)?,
            path: node.get(props::FILE_PATH)?,
            content_hash: node.get::<String>(props::CONTENT_HASH).ok(),
            state: node.get::<String>("state")?.parse()?,
            last_error: node.get::<String>("last_error").ok(),
            retry_count: node.get::<i64>("retry_count").unwrap_or(0) as u32,
            last_processed_at: node
                .get::<String>("last_processed_at")
                .ok()
                .and_then(|s| s.parse().ok()),
            state_changed_at: node
                .get::<String>("state_changed_at")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(Utc::now),
            pending_orphans: node
                .get::<Vec<String>>("pending_orphans")
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        })
    }

    fn node_to_project(&self, node: &neo4rs::Node) -> Result<Project> {
        Ok(Project {
            id: node.get("id")?,
            root_path: node.get("root_path")?,
            project_type: node.get::<String>("project_type")?.parse()?,
            excluded: node.get("excluded").unwrap_or(false),
            last_accessed: node
                .get::<String>("last_accessed")
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }

    fn relation_to_relationship(
        &self,
        rel: &neo4rs::Relation,
        from: Uuid,
        to: Uuid,
        rel_type: String,
    ) -> Relationship {
        let mut properties = Properties::new();
        for key in rel.keys() {
            if key == "key" {
                continue;
            }
            if let Some(value) = relation_property(rel, key) {
                properties.insert(key.to_string(), value);
            }
        }
        Relationship {
            from,
            to,
            rel_type,
            properties,
        }
    }

    /// MERGE query writing a file record onto its `SourceFile` node.
    fn file_record_query(&self, record: &FileRecord) -> Query {
        let uuid = crate::ingest::identity::file_node_uuid(&record.project_id, &record.path);
        query(
            r#"
            MERGE (f:SourceFile {uuid: $uuid})
            SET f:Entity,
                f.project_id = $project_id,
                f.file_path = $path,
                f.content_hash = $content_hash,
                f.state = $state,
                f.last_error = $last_error,
                f.retry_count = $retry_count,
                f.last_processed_at = $last_processed_at,
                f.state_changed_at = $state_changed_at,
                f.pending_orphans = $pending_orphans
            "#,
        )
        .param("uuid", uuid.to_string())
        .param("project_id", record.project_id.clone())
        .param("path", record.path.clone())
        .param("content_hash", record.content_hash.clone())
        .param("state", record.state.as_str())
        .param("last_error", record.last_error.clone())
        .param("retry_count", record.retry_count as i64)
        .param(
            "last_processed_at",
            record.last_processed_at.map(|t| t.to_rfc3339()),
        )
        .param("state_changed_at", record.state_changed_at.to_rfc3339())
        .param(
            "pending_orphans",
            record
                .pending_orphans
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>(),
        )
    }

    // ========================================================================
    // Project operations
    // ========================================================================

    /// Create or update a project by id
    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        let q = query(
            r#"
            MERGE (p:Project {id: $id})
            SET p.root_path = $root_path,
                p.project_type = $project_type,
                p.excluded = $excluded,
                p.last_accessed = $last_accessed
            "#,
        )
        .param("id", project.id.clone())
        .param("root_path", project.root_path.clone())
        .param("project_type", project.project_type.as_str())
        .param("excluded", project.excluded)
        .param("last_accessed", project.last_accessed.map(|t| t.to_rfc3339()));

        self.graph
            .run(q)
            .await
            .context(format!("Failed to upsert project {}", project.id))?;
        Ok(())
    }

    /// List all registered projects
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let q = query("MATCH (p:Project) RETURN p ORDER BY p.id");
        let mut result = self.graph.execute(q).await?;
        let mut projects = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("p")?;
            projects.push(self.node_to_project(&node)?);
        }
        Ok(projects)
    }

    /// Update a project's last access timestamp
    pub async fn touch_project(&self, project_id: &str) -> Result<()> {
        let q = query("MATCH (p:Project {id: $id}) SET p.last_accessed = $now")
            .param("id", project_id)
            .param("now", Utc::now().to_rfc3339());
        self.graph.run(q).await?;
        Ok(())
    }

    // ========================================================================
    // File records
    // ========================================================================

    pub async fn get_file_record(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let q = query(
            "MATCH (f:SourceFile {project_id: $project_id, file_path: $path}) RETURN f",
        )
        .param("project_id", project_id)
        .param("path", path);
        let mut result = self.graph.execute(q).await?;
        match result.next().await? {
            Some(row) => {
                let node: neo4rs::Node = row.get("f")?;
                Ok(Some(self.node_to_file_record(&node)?))
            }
            None => Ok(None),
        }
    }

    pub async fn get_file_records(
        &self,
        project_id: &str,
        paths: &[String],
    ) -> Result<Vec<FileRecord>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let q = query(
            r#"
            MATCH (f:SourceFile {project_id: $project_id})
            WHERE f.file_path IN $paths
            RETURN f
            "#,
        )
        .param("project_id", project_id)
        .param("paths", paths.to_vec());
        let mut result = self.graph.execute(q).await?;
        let mut records = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("f")?;
            records.push(self.node_to_file_record(&node)?);
        }
        Ok(records)
    }

    pub async fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        self.graph
            .run(self.file_record_query(record))
            .await
            .context(format!("Failed to write file record {}", record.path))?;
        Ok(())
    }

    pub async fn list_file_records(
        &self,
        project_id: Option<&str>,
        state: Option<FileState>,
    ) -> Result<Vec<FileRecord>> {
        let q = query(
            r#"
            MATCH (f:SourceFile)
            WHERE ($project_id IS NULL OR f.project_id = $project_id)
              AND ($state IS NULL OR f.state = $state)
            RETURN f
            ORDER BY f.project_id, f.file_path
            "#,
        )
        .param("project_id", project_id.map(str::to_string))
        .param("state", state.map(|s| s.as_str().to_string()));
        let mut result = self.graph.execute(q).await?;
        let mut records = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("f")?;
            records.push(self.node_to_file_record(&node)?);
        }
        Ok(records)
    }

    // ========================================================================
    // Derived nodes
    // ========================================================================

    pub async fn get_file_node_digests(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<StoredNodeDigest>> {
        let q = query(
            r#"
            MATCH (n:Entity {project_id: $project_id, file_path: $path})
            WHERE NOT n:SourceFile
            RETURN n.uuid AS uuid, labels(n) AS labels, n.content_hash AS content_hash
            "#,
        )
        .param("project_id", project_id)
        .param("path", path);
        let mut result = self.graph.execute(q).await?;
        let mut digests = Vec::new();
        while let Some(row) = result.next().await? {
            let labels: Vec<String> = row.get("labels")?;
            digests.push(StoredNodeDigest {
                uuid: row.get::<String>("uuid")?.parse()?,
                label: labels
                    .into_iter()
                    .find(|l| l != "Entity")
                    .unwrap_or_default(),
                content_hash: row.get::<String>("content_hash").ok(),
            });
        }
        Ok(digests)
    }

    /// Write one file's batch in a single transaction.
    ///
    /// Nodes are grouped by label and edges by type so each group is one
    /// UNWIND query.
    pub async fn commit_file_batch(&self, batch: &FileWriteBatch) -> Result<()> {
        let mut queries = vec![self.file_record_query(&batch.record)];

        let mut nodes_by_label: Vec<(&str, Vec<HashMap<String, BoltType>>)> = Vec::new();
        for node in &batch.upsert_nodes {
            validate_identifier("label", &node.label)?;
            let mut row: HashMap<String, BoltType> = HashMap::new();
            row.insert("uuid".to_string(), node.uuid.to_string().into());
            row.insert("project_id".to_string(), node.project_id.clone().into());
            row.insert("props".to_string(), properties_to_bolt(&node.properties).into());
            match nodes_by_label.iter_mut().find(|(l, _)| *l == node.label) {
                Some((_, group)) => group.push(row),
                None => nodes_by_label.push((node.label.as_str(), vec![row])),
            }
        }
        for (label, rows) in nodes_by_label {
            let cypher = format!(
                "UNWIND $nodes AS row
                 MERGE (n:Entity {{uuid: row.uuid}})
                 SET n:{label}, n += row.props, n.project_id = row.project_id"
            );
            queries.push(Query::new(cypher).param("nodes", rows));
        }

        queries.push(
            query(
                r#"
                MATCH ()-[r]->()
                WHERE r.project_id = $project_id AND r.source_file = $path
                  AND NOT r.key IN $keys
                DELETE r
                "#,
            )
            .param("project_id", batch.project_id())
            .param("path", batch.path())
            .param("keys", batch.relationship_keys()),
        );

        let mut rels_by_type: Vec<(&str, Vec<HashMap<String, BoltType>>)> = Vec::new();
        for rel in &batch.relationships {
            validate_identifier("relationship type", &rel.rel_type)?;
            let mut row: HashMap<String, BoltType> = HashMap::new();
            row.insert("from".to_string(), rel.from.to_string().into());
            row.insert("to".to_string(), rel.to.to_string().into());
            row.insert("key".to_string(), rel.key_string().into());
            row.insert("props".to_string(), properties_to_bolt(&rel.properties).into());
            match rels_by_type.iter_mut().find(|(t, _)| *t == rel.rel_type) {
                Some((_, group)) => group.push(row),
                None => rels_by_type.push((rel.rel_type.as_str(), vec![row])),
            }
        }
        for (rel_type, rows) in rels_by_type {
            let cypher = format!(
                "UNWIND $rels AS rel
                 MATCH (a:Entity {{uuid: rel.from}}), (b:Entity {{uuid: rel.to}})
                 MERGE (a)-[r:{rel_type}]->(b)
                 SET r += rel.props, r.key = rel.key,
                     r.project_id = $project_id, r.source_file = $path"
            );
            queries.push(
                Query::new(cypher)
                    .param("rels", rows)
                    .param("project_id", batch.project_id())
                    .param("path", batch.path()),
            );
        }

        let mut txn = self
            .graph
            .start_txn()
            .await
            .context("Failed to start transaction")?;
        if let Err(e) = txn.run_queries(queries).await {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!("Rollback failed for {}: {}", batch.path(), rollback);
            }
            return Err(anyhow!(e).context(format!("Failed to write batch for {}", batch.path())));
        }
        txn.commit()
            .await
            .context(format!("Failed to commit batch for {}", batch.path()))?;
        Ok(())
    }

    pub async fn delete_nodes(&self, uuids: &[Uuid]) -> Result<usize> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let q = query(
            r#"
            MATCH (n:Entity) WHERE n.uuid IN $uuids
            WITH n, n.uuid AS id
            DETACH DELETE n
            RETURN count(id) AS removed
            "#,
        )
        .param(
            "uuids",
            uuids.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        );
        let mut result = self.graph.execute(q).await?;
        let removed = match result.next().await? {
            Some(row) => row.get::<i64>("removed").unwrap_or(0) as usize,
            None => 0,
        };
        Ok(removed)
    }

    pub async fn delete_file_nodes(&self, project_id: &str, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let q = query(
            r#"
            MATCH (n:Entity {project_id: $project_id})
            WHERE n.file_path IN $paths AND NOT n:SourceFile
            WITH n, n.uuid AS id
            DETACH DELETE n
            RETURN count(id) AS removed
            "#,
        )
        .param("project_id", project_id)
        .param("paths", paths.to_vec());
        let mut result = self.graph.execute(q).await?;
        let removed = match result.next().await? {
            Some(row) => row.get::<i64>("removed").unwrap_or(0) as usize,
            None => 0,
        };

        // Owned edges whose endpoints live in other files
        let q = query(
            r#"
            MATCH ()-[r]->()
            WHERE r.project_id = $project_id AND r.source_file IN $paths
            DELETE r
            "#,
        )
        .param("project_id", project_id)
        .param("paths", paths.to_vec());
        self.graph.run(q).await?;

        Ok(removed)
    }

    pub async fn get_node(&self, uuid: Uuid) -> Result<Option<GraphNode>> {
        Ok(self.get_nodes(&[uuid]).await?.into_iter().next())
    }

    pub async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<GraphNode>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let q = query("MATCH (n:Entity) WHERE n.uuid IN $uuids RETURN n").param(
            "uuids",
            uuids.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        );
        let mut result = self.graph.execute(q).await?;
        let mut nodes = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("n")?;
            nodes.push(self.node_to_graph_node(&node)?);
        }
        Ok(nodes)
    }

    // ========================================================================
    // Search and traversal
    // ========================================================================

    pub async fn find_candidates(
        &self,
        filter: &NodeFilter,
        terms: &[String],
        offset: usize,
        page_size: usize,
    ) -> Result<CandidatePage> {
        let glob = filter.compile_glob()?;
        let (mut where_clause, params) = filter_clause("n", filter);
        if !terms.is_empty() {
            let fields: Vec<String> = props::TEXT_FIELDS
                .iter()
                .map(|f| format!("toLower(toString(coalesce(n.{}, ''))) CONTAINS t", f))
                .collect();
            where_clause.push_str(&format!(
                " AND any(t IN $terms WHERE {})",
                fields.join(" OR ")
            ));
        }
        let cypher = format!(
            "MATCH (n:Entity) WHERE {where_clause}
             RETURN n ORDER BY n.file_path, n.start_line, n.uuid
             SKIP $offset LIMIT $page_size"
        );
        let mut q = query(&cypher)
            .param("offset", offset as i64)
            .param("page_size", page_size as i64);
        if !terms.is_empty() {
            q = q.param("terms", terms.to_vec());
        }
        for (name, value) in params {
            q = q.param(name, value);
        }

        let mut result = self.graph.execute(q).await?;
        let mut rows = 0;
        let mut nodes = Vec::new();
        while let Some(row) = result.next().await? {
            rows += 1;
            let node: neo4rs::Node = row.get("n")?;
            let node = self.node_to_graph_node(&node)?;
            // The glob has no Cypher equivalent
            if filter.matches_with(&node, glob.as_ref()) {
                nodes.push(node);
            }
        }
        Ok(CandidatePage {
            nodes,
            next_offset: (rows >= page_size).then_some(offset + rows),
        })
    }

    /// Vector search over one embedding field's HNSW index.
    ///
    /// Neo4j reports cosine scores normalized to `[0, 1]`; they are mapped
    /// back to raw cosine similarity.
    pub async fn vector_search(
        &self,
        field: EmbeddingField,
        embedding: &[f32],
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(GraphNode, f64)>> {
        let index = field
            .index_name()
            .ok_or_else(|| anyhow!("vector_search needs a concrete embedding field"))?;
        let glob = filter.compile_glob()?;
        let embedding_f64: Vec<f64> = embedding.iter().map(|&x| x as f64).collect();
        let (where_clause, params) = filter_clause("n", filter);

        // Query more than limit to allow for post-filtering
        let query_limit = (limit * 3).max(10);
        let cypher = format!(
            "CALL db.index.vector.queryNodes('{index}', $query_limit, $embedding)
             YIELD node AS n, score
             WHERE {where_clause}
             RETURN n, score
             ORDER BY score DESC"
        );
        let mut q = query(&cypher)
            .param("query_limit", query_limit as i64)
            .param("embedding", embedding_f64);
        for (name, value) in params {
            q = q.param(name, value);
        }

        let mut result = self.graph.execute(q).await?;
        let mut scored = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("n")?;
            let score: f64 = row.get("score")?;
            let node = self.node_to_graph_node(&node)?;
            if filter.matches_with(&node, glob.as_ref()) {
                scored.push((node, score * 2.0 - 1.0));
                if scored.len() >= limit {
                    break;
                }
            }
        }
        Ok(scored)
    }

    pub async fn get_neighbors(
        &self,
        uuid: Uuid,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let mut branches = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            branches.push(
                "MATCH (a:Entity {uuid: $uuid})-[r]->(b:Entity)
                 RETURN r, type(r) AS rel_type, b, 'outgoing' AS dir",
            );
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            branches.push(
                "MATCH (a:Entity {uuid: $uuid})<-[r]-(b:Entity)
                 RETURN r, type(r) AS rel_type, b, 'incoming' AS dir",
            );
        }
        let cypher = format!(
            "CALL {{ {} }} RETURN r, rel_type, b, dir ORDER BY rel_type, dir, b.uuid LIMIT $limit",
            branches.join(" UNION ALL ")
        );
        let q = query(&cypher)
            .param("uuid", uuid.to_string())
            .param("limit", limit as i64);

        let mut result = self.graph.execute(q).await?;
        let mut neighbors = Vec::new();
        while let Some(row) = result.next().await? {
            let rel: neo4rs::Relation = row.get("r")?;
            let rel_type: String = row.get("rel_type")?;
            let other: neo4rs::Node = row.get("b")?;
            let other = self.node_to_graph_node(&other)?;
            let dir = if row.get::<String>("dir")? == "outgoing" {
                Direction::Outgoing
            } else {
                Direction::Incoming
            };
            let (from, to) = match dir {
                Direction::Outgoing => (uuid, other.uuid),
                _ => (other.uuid, uuid),
            };
            neighbors.push(Neighbor {
                relationship: self.relation_to_relationship(&rel, from, to, rel_type),
                node: other,
                direction: dir,
            });
        }
        Ok(neighbors)
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    pub async fn list_dirty_embedding_nodes(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let q = query(
            r#"
            MATCH (n:Entity {embeddings_dirty: true})
            WHERE NOT n:SourceFile
              AND ($project_id IS NULL OR n.project_id = $project_id)
            RETURN n
            ORDER BY n.uuid
            LIMIT $limit
            "#,
        )
        .param("project_id", project_id.map(str::to_string))
        .param("limit", limit as i64);
        let mut result = self.graph.execute(q).await?;
        let mut nodes = Vec::new();
        while let Some(row) = result.next().await? {
            let node: neo4rs::Node = row.get("n")?;
            nodes.push(self.node_to_graph_node(&node)?);
        }
        Ok(nodes)
    }

    pub async fn set_node_embeddings(
        &self,
        uuid: Uuid,
        embeddings: &[(EmbeddingField, Vec<f32>)],
        model: &str,
    ) -> Result<()> {
        let mut sets = vec![
            "n.embeddings_dirty = false".to_string(),
            "n.embedding_model = $model".to_string(),
            "n.embedded_at = $now".to_string(),
        ];
        let mut q_params: Vec<(String, Vec<f64>)> = Vec::new();
        for (field, vector) in embeddings {
            let Some(prop) = field.property_name() else {
                continue;
            };
            sets.push(format!("n.{prop} = ${prop}"));
            q_params.push((prop.to_string(), vector.iter().map(|&x| x as f64).collect()));
        }
        let cypher = format!("MATCH (n:Entity {{uuid: $uuid}}) SET {}", sets.join(", "));
        let mut q = query(&cypher)
            .param("uuid", uuid.to_string())
            .param("model", model)
            .param("now", Utc::now().to_rfc3339());
        for (name, vector) in q_params {
            q = q.param(&name, vector);
        }
        self.graph
            .run(q)
            .await
            .context(format!("Failed to set embeddings on node {}", uuid))?;
        Ok(())
    }

    pub async fn count_dirty_embeddings_for_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize> {
        let q = query(
            r#"
            MATCH (n:Entity {project_id: $project_id, file_path: $path, embeddings_dirty: true})
            WHERE NOT n:SourceFile
            RETURN count(n) AS dirty
            "#,
        )
        .param("project_id", project_id)
        .param("path", path);
        let mut result = self.graph.execute(q).await?;
        let dirty = match result.next().await? {
            Some(row) => row.get::<i64>("dirty").unwrap_or(0) as usize,
            None => 0,
        };
        Ok(dirty)
    }

    pub async fn complete_file_embedding(
        &self,
        project_id: &str,
        path: &str,
        expected_hash: Option<&str>,
    ) -> Result<bool> {
        let uuid = crate::ingest::identity::file_node_uuid(project_id, path);
        // The first SET takes the record's write lock, so ingestion commits
        // cannot interleave between the checks and the update
        let q = query(
            r#"
            MATCH (f:SourceFile {uuid: $uuid})
            SET f._completing = true
            WITH f
            OPTIONAL MATCH (n:Entity {project_id: $project_id, file_path: $path, embeddings_dirty: true})
            WHERE NOT n:SourceFile
            WITH f, count(n) AS dirty
            WITH f, dirty = 0
                 AND f.state = $pending
                 AND coalesce(f.content_hash, '') = coalesce($expected_hash, '') AS ok
            FOREACH (_ IN CASE WHEN ok THEN [1] ELSE [] END |
                SET f.state = $embedded, f.state_changed_at = $now)
            REMOVE f._completing
            RETURN ok
            "#,
        )
        .param("uuid", uuid.to_string())
        .param("project_id", project_id)
        .param("path", path)
        .param("expected_hash", expected_hash.map(str::to_string))
        .param("pending", FileState::EmbeddingPending.as_str())
        .param("embedded", FileState::Embedded.as_str())
        .param("now", Utc::now().to_rfc3339());
        let mut result = self.graph.execute(q).await?;
        let completed = match result.next().await? {
            Some(row) => row.get::<bool>("ok").unwrap_or(false),
            None => false,
        };
        Ok(completed)
    }
}
