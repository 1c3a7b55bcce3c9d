//! Minimal Elasticsearch REST client.
//!
//! Covers the handful of calls the pipeline needs, authenticated with an
//! `Authorization: ApiKey <key>` header:
//!
//! | Call | Request |
//! |------|---------|
//! | [`ElasticClient::ping`] | `GET /` |
//! | [`ElasticClient::index_exists`] | `HEAD /{index}` |
//! | [`ElasticClient::create_index`] | `PUT /{index}` |
//! | [`ElasticClient::bulk`] | `POST /_bulk` (NDJSON) |
//! | [`ElasticClient::search`] | `POST /{index}/_search` |
//!
//! The cluster URL comes from `ElasticSearch.CloudEndPoint` when present,
//! otherwise it is decoded from `ElasticSearch.CloudId`.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{required, AppSettings};
use crate::models::IndexAction;

pub struct ElasticClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Summary of a `_bulk` response.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub submitted: usize,
    pub succeeded: usize,
    /// `(position, reason)` of every rejected action.
    pub failures: Vec<(usize, String)>,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl ElasticClient {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let es = &settings.elastic_search;
        let api_key = required(&es.api_key, "ElasticSearch.ApiKey")?.to_string();
        let base_url = match es.cloud_endpoint.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(endpoint) => endpoint.to_string(),
            None => decode_cloud_id(required(&es.cloud_id, "ElasticSearch.CloudId")?)?,
        };
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth(&self) -> String {
        format!("ApiKey {}", self.api_key)
    }

    /// `true` when the cluster answers `GET /` with a success status.
    pub async fn ping(&self) -> Result<bool> {
        let resp = self
            .client
            .get(self.url("/"))
            .header("Authorization", self.auth())
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;
        Ok(resp.status().is_success())
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.url(index))
            .header("Authorization", self.auth())
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            other => bail!("Unexpected status {} checking index '{}'", other, index),
        }
    }

    /// Create `index`, mapping `embedding` as a cosine `dense_vector` when `dims` is known.
    pub async fn create_index(&self, index: &str, dims: Option<usize>) -> Result<()> {
        let mut req = self
            .client
            .put(self.url(index))
            .header("Authorization", self.auth());
        if let Some(body) = index_mapping(dims) {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Failed to create index '{}': {} {}", index, status, body_text);
        }
        Ok(())
    }

    /// Create `index` if absent. Returns `true` when it was created.
    pub async fn ensure_index(&self, index: &str, dims: Option<usize>) -> Result<bool> {
        if self.index_exists(index).await? {
            return Ok(false);
        }
        self.create_index(index, dims).await?;
        Ok(true)
    }

    /// Submit every action in a single `_bulk` request.
    pub async fn bulk(&self, actions: &[IndexAction]) -> Result<BulkReport> {
        let body = bulk_body(actions)?;

        let resp = self
            .client
            .post(self.url("_bulk"))
            .header("Authorization", self.auth())
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("Bulk request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Bulk request rejected: {} {}", status, body_text);
        }

        let parsed: BulkResponse = resp.json().await.context("Failed to parse bulk response")?;
        Ok(bulk_report(actions.len(), &parsed))
    }

    pub async fn search(&self, index: &str, query: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.url(&format!("{}/_search", index)))
            .header("Authorization", self.auth())
            .json(query)
            .send()
            .await
            .context("Search request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Search rejected: {} {}", status, body_text);
        }
        Ok(resp.json().await?)
    }
}

/// Decode an Elastic Cloud id (`name:base64(host$es_uuid$kibana_uuid)`)
/// into the Elasticsearch HTTPS endpoint.
pub fn decode_cloud_id(cloud_id: &str) -> Result<String> {
    let encoded = cloud_id
        .split_once(':')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("Invalid CloudId: expected '<name>:<base64>'"))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("Invalid CloudId: not base64")?;
    let decoded = String::from_utf8(decoded).context("Invalid CloudId: not UTF-8")?;

    let mut parts = decoded.split('$');
    let host = parts.next().filter(|h| !h.is_empty());
    let es_uuid = parts.next().filter(|u| !u.is_empty());
    let (host, es_uuid) = match (host, es_uuid) {
        (Some(h), Some(u)) => (h, u),
        _ => bail!("Invalid CloudId: expected 'host$es_uuid$kibana_uuid'"),
    };

    let (host, port) = match host.rsplit_once(':') {
        Some((h, p)) => (h, p),
        None => (host, "443"),
    };

    Ok(format!("https://{}.{}:{}", es_uuid, host, port))
}

fn index_mapping(dims: Option<usize>) -> Option<Value> {
    dims.map(|dims| {
        serde_json::json!({
            "mappings": {
                "properties": {
                    "file_name": { "type": "keyword" },
                    "path": { "type": "keyword" },
                    "content": { "type": "text" },
                    "embedding": {
                        "type": "dense_vector",
                        "dims": dims,
                        "index": true,
                        "similarity": "cosine"
                    }
                }
            }
        })
    })
}

/// Serialize actions as `_bulk` NDJSON: an `index` line then the source line.
pub fn bulk_body(actions: &[IndexAction]) -> Result<String> {
    let mut body = String::new();
    for action in actions {
        let meta = serde_json::json!({ "index": { "_index": action.index } });
        body.push_str(&serde_json::to_string(&meta)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&action.source)?);
        body.push('\n');
    }
    Ok(body)
}

fn bulk_report(submitted: usize, resp: &BulkResponse) -> BulkReport {
    let mut failures = Vec::new();
    if resp.errors {
        for (pos, item) in resp.items.iter().enumerate() {
            let result = item
                .as_object()
                .and_then(|o| o.values().next())
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(err) = result.get("error") {
                let reason = err
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| err.to_string());
                failures.push((pos, reason));
            }
        }
    }

    BulkReport {
        submitted,
        succeeded: submitted.saturating_sub(failures.len()),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmbeddingDocument;
    use serde_json::json;

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn decode_cloud_id_default_port() {
        let id = format!("my-deploy:{}", encode("eu-west-1.aws.found.io$abc123$kib456"));
        assert_eq!(
            decode_cloud_id(&id).unwrap(),
            "https://abc123.eu-west-1.aws.found.io:443"
        );
    }

    #[test]
    fn decode_cloud_id_explicit_port() {
        let id = format!("dep:{}", encode("us-central1.gcp.cloud.es.io:9243$es1$kb1"));
        assert_eq!(
            decode_cloud_id(&id).unwrap(),
            "https://es1.us-central1.gcp.cloud.es.io:9243"
        );
    }

    #[test]
    fn decode_cloud_id_rejects_garbage() {
        assert!(decode_cloud_id("no-colon").is_err());
        assert!(decode_cloud_id("name:!!!").is_err());
        assert!(decode_cloud_id(&format!("name:{}", encode("hostonly"))).is_err());
    }

    #[test]
    fn cloud_endpoint_overrides_cloud_id() {
        let mut settings = AppSettings::default();
        settings.elastic_search.api_key = Some("k".into());
        settings.elastic_search.cloud_id = Some("broken".into());
        settings.elastic_search.cloud_endpoint = Some("http://127.0.0.1:9200/".into());
        let client = ElasticClient::from_settings(&settings).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9200");
    }

    #[test]
    fn bulk_body_is_two_lines_per_action() {
        let actions: Vec<IndexAction> = (0..3)
            .map(|i| IndexAction {
                index: "idx".into(),
                source: EmbeddingDocument {
                    file_name: format!("f{}.cs", i),
                    path: format!("src/f{}.cs", i),
                    content: "line1\nline2".into(),
                    embedding: vec![1.0, 2.0],
                },
            })
            .collect();
        let body = bulk_body(&actions).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 6);
        let meta: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta, json!({"index": {"_index": "idx"}}));
        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["content"], "line1\nline2");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_report_collects_item_errors() {
        let resp: BulkResponse = serde_json::from_value(json!({
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"status": 201, "result": "created"}},
                {"index": {"status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad vector"}}}
            ]
        }))
        .unwrap();
        let report = bulk_report(2, &resp);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures, vec![(1, "bad vector".to_string())]);
    }

    #[test]
    fn mapping_only_with_dims() {
        assert!(index_mapping(None).is_none());
        let mapping = index_mapping(Some(1536)).unwrap();
        assert_eq!(mapping["mappings"]["properties"]["embedding"]["dims"], 1536);
    }
}
