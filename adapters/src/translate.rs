use crate::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphOperation {
    /// Match nodes by label/token, then expand. Read-only.
    Match,
    /// Expand from explicit seed node ids. Read-only.
    Expand,
    /// Anything the translator produced that is not a read-only traversal.
    /// The validator rejects it; retrieval falls back to the template path.
    Mutation,
}

/// Structured graph query produced by the NL translator. The whitelist
/// validator in the retrieval pipeline is the only consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQuery {
    pub operation: GraphOperation,
    pub container_id: Option<String>,
    #[serde(default)]
    pub node_labels: Vec<String>,
    #[serde(default)]
    pub edge_types: Vec<String>,
    #[serde(default)]
    pub seed_tokens: Vec<String>,
    #[serde(default)]
    pub seed_node_ids: Vec<String>,
    pub max_hops: u8,
    /// Named parameters; every value must be bound or the validator rejects.
    #[serde(default)]
    pub params: Vec<(String, Option<String>)>,
}

/// Schema handed to the translator so it can stay inside the whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSchemaHint {
    pub container_id: String,
    pub node_labels: Vec<String>,
    pub edge_types: Vec<String>,
    pub max_hops: u8,
}

#[async_trait]
pub trait NlTranslator: Send + Sync {
    async fn translate(
        &self,
        query: &str,
        schema: &GraphSchemaHint,
    ) -> Result<GraphQuery, AdapterError>;
}

/// Local translator: picks schema labels mentioned in the query and carries
/// the remaining tokens as match seeds. Always produces a valid read-only
/// query.
#[derive(Default)]
pub struct KeywordTranslator;

#[async_trait]
impl NlTranslator for KeywordTranslator {
    async fn translate(
        &self,
        query: &str,
        schema: &GraphSchemaHint,
    ) -> Result<GraphQuery, AdapterError> {
        let lowered = query.to_lowercase();
        let node_labels: Vec<String> = schema
            .node_labels
            .iter()
            .filter(|label| lowered.contains(&label.to_lowercase()))
            .cloned()
            .collect();
        let edge_types: Vec<String> = schema
            .edge_types
            .iter()
            .filter(|ty| lowered.contains(&ty.to_lowercase()))
            .cloned()
            .collect();

        let seed_tokens: Vec<String> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();

        Ok(GraphQuery {
            operation: GraphOperation::Match,
            container_id: Some(schema.container_id.clone()),
            node_labels,
            edge_types,
            seed_tokens,
            seed_node_ids: Vec::new(),
            max_hops: schema.max_hops,
            params: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> GraphSchemaHint {
        GraphSchemaHint {
            container_id: "ct_1".to_string(),
            node_labels: vec!["Artist".to_string(), "Movement".to_string()],
            edge_types: vec!["INFLUENCED_BY".to_string()],
            max_hops: 2,
        }
    }

    #[tokio::test]
    async fn translation_stays_inside_schema() {
        let translator = KeywordTranslator;
        let query = translator
            .translate("which artist influenced the movement", &schema())
            .await
            .unwrap();

        assert_eq!(query.operation, GraphOperation::Match);
        assert_eq!(query.container_id.as_deref(), Some("ct_1"));
        assert_eq!(query.node_labels, vec!["Artist", "Movement"]);
        assert_eq!(query.max_hops, 2);
        assert!(query.seed_tokens.contains(&"influenced".to_string()));
    }
}
