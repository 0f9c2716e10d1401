use crate::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub text: String,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    /// Entity text of the source and target; the graph builder resolves them
    /// to container-scoped node ids.
    pub source: String,
    pub target: String,
    pub relation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Extraction, AdapterError>;
}

/// Dictionary-driven extractor. Entities are keyword matches; relations are
/// co-occurrence edges within the same chunk.
pub struct KeywordEntityExtractor {
    keywords: Vec<(String, String)>, // (keyword, label)
    co_occurrence_relation: String,
}

impl KeywordEntityExtractor {
    pub fn new(keywords: Vec<(String, String)>) -> Self {
        Self {
            keywords,
            co_occurrence_relation: "CO_MENTIONED".to_string(),
        }
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.co_occurrence_relation = relation.into();
        self
    }
}

impl Default for KeywordEntityExtractor {
    fn default() -> Self {
        Self::new(vec![
            ("Kandinsky".to_string(), "Artist".to_string()),
            ("Klee".to_string(), "Artist".to_string()),
            ("Bauhaus".to_string(), "Movement".to_string()),
            ("Expressionism".to_string(), "Movement".to_string()),
        ])
    }
}

#[async_trait]
impl EntityExtractor for KeywordEntityExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction, AdapterError> {
        let lower_text = text.to_lowercase();

        let entities: Vec<Entity> = self
            .keywords
            .iter()
            .filter(|(keyword, _)| lower_text.contains(&keyword.to_lowercase()))
            .map(|(keyword, label)| Entity {
                text: keyword.clone(),
                label: label.clone(),
                confidence: 0.9,
            })
            .collect();

        let mut relations = Vec::new();
        for (i, source) in entities.iter().enumerate() {
            for target in entities.iter().skip(i + 1) {
                relations.push(Relation {
                    source: source.text.clone(),
                    target: target.text.clone(),
                    relation: self.co_occurrence_relation.clone(),
                });
            }
        }

        Ok(Extraction {
            entities,
            relations,
        })
    }
}
