//! Semantic search over the indexed embedding documents.
//!
//! The query text is embedded with the same endpoint used at indexing time
//! and scored against every document with a `script_score` query:
//!
//! ```text
//! cosineSimilarity(params.query_vector, 'embedding') + 1.0
//! ```
//!
//! The `+ 1.0` keeps scores non-negative, as Elasticsearch requires.

use anyhow::Result;
use serde_json::Value;

use crate::elastic::ElasticClient;
use crate::embedding::Embedder;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub path: String,
    pub file_name: String,
    pub score: f64,
    pub content: String,
}

pub fn script_score_query(query_vector: &[f32], size: usize) -> Value {
    serde_json::json!({
        "size": size,
        "_source": ["file_name", "path", "content"],
        "query": {
            "script_score": {
                "query": { "match_all": {} },
                "script": {
                    "source": "cosineSimilarity(params.query_vector, 'embedding') + 1.0",
                    "params": { "query_vector": query_vector }
                }
            }
        }
    })
}

pub async fn semantic_search(
    client: &ElasticClient,
    embedder: &dyn Embedder,
    index: &str,
    query: &str,
    size: usize,
) -> Result<Vec<SearchHit>> {
    let vector = embedder.embed(query).await?;
    let response = client
        .search(index, &script_score_query(&vector, size))
        .await?;
    Ok(parse_hits(&response))
}

/// Hits without a `content` field are dropped.
pub fn parse_hits(response: &Value) -> Vec<SearchHit> {
    let hits = match response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(|h| h.as_array())
    {
        Some(hits) => hits,
        None => return Vec::new(),
    };

    hits.iter()
        .filter_map(|hit| {
            let source = hit.get("_source")?;
            let content = source.get("content")?.as_str()?.to_string();
            let field = |name: &str| {
                source
                    .get(name)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            Some(SearchHit {
                path: field("path"),
                file_name: field("file_name"),
                score: hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                content,
            })
        })
        .collect()
}

pub fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, hit.score, hit.path);
        let preview: String = hit.content.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_carries_vector_and_size() {
        let q = script_score_query(&[0.5, -0.5], 2);
        assert_eq!(q["size"], 2);
        assert_eq!(
            q["query"]["script_score"]["script"]["params"]["query_vector"],
            json!([0.5, -0.5])
        );
        assert_eq!(q["query"]["script_score"]["query"], json!({"match_all": {}}));
    }

    #[test]
    fn parses_hits_and_skips_contentless() {
        let resp = json!({
            "hits": {
                "total": {"value": 3},
                "hits": [
                    {"_score": 1.9, "_source": {"path": "src/a.cs", "file_name": "a.cs", "content": "A"}},
                    {"_score": 1.5, "_source": {"path": "src/b.cs"}},
                    {"_score": 1.2, "_source": {"content": "C"}}
                ]
            }
        });
        let hits = parse_hits(&resp);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "src/a.cs");
        assert_eq!(hits[0].score, 1.9);
        assert_eq!(hits[1].content, "C");
        assert_eq!(hits[1].path, "");
    }

    #[test]
    fn malformed_response_yields_nothing() {
        assert!(parse_hits(&json!({"error": "x"})).is_empty());
    }
}
