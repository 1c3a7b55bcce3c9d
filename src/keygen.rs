//! Elasticsearch API key regeneration.
//!
//! Posts a fixed key descriptor (all cluster privileges, all privileges on
//! every index) to `ElasticSearch.RegenerateApiKeyEndpoint` using basic
//! authentication. A single attempt is made; every outcome, including a
//! transport failure, is reported rather than raised.

use anyhow::Result;
use serde_json::Value;

use crate::config::{required, AppSettings, KeygenConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum KeyRotationOutcome {
    /// HTTP 200; carries the response body (id, name, api_key, encoded, ...).
    Created(Value),
    Rejected { status: u16, body: String },
    Unreachable { reason: String },
}

pub fn api_key_request(config: &KeygenConfig) -> Value {
    serde_json::json!({
        "name": config.name,
        "expiration": config.expiration,
        "role_descriptors": {
            "role": {
                "cluster": ["all"],
                "index": [
                    {
                        "names": ["*"],
                        "privileges": ["all"]
                    }
                ]
            }
        }
    })
}

/// Missing settings are an error; everything after the settings lookup is
/// folded into the outcome.
pub async fn rotate_api_key(
    settings: &AppSettings,
    config: &KeygenConfig,
) -> Result<KeyRotationOutcome> {
    let es = &settings.elastic_search;
    let url = required(
        &es.regenerate_api_key_endpoint,
        "ElasticSearch.RegenerateApiKeyEndpoint",
    )?;
    let username = required(&es.username, "ElasticSearch.Username")?;
    let password = required(&es.password, "ElasticSearch.Password")?;

    let client = reqwest::Client::new();
    let resp = client
        .post(url)
        .basic_auth(username, Some(password))
        .header("Content-Type", "application/json")
        .json(&api_key_request(config))
        .send()
        .await;

    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(url, error = %e, "api key request failed");
            return Ok(KeyRotationOutcome::Unreachable {
                reason: e.to_string(),
            });
        }
    };

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    if status.as_u16() == 200 {
        let json = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Ok(KeyRotationOutcome::Created(json))
    } else {
        Ok(KeyRotationOutcome::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

pub fn print_outcome(outcome: &KeyRotationOutcome) {
    println!("rotate-key");
    match outcome {
        KeyRotationOutcome::Created(body) => {
            println!("  api key created");
            println!("  {}", body);
        }
        KeyRotationOutcome::Rejected { status, body } => {
            println!("  api key creation failed: {}", status);
            println!("  {}", body);
        }
        KeyRotationOutcome::Unreachable { reason } => {
            println!("  api key creation failed: {}", reason);
        }
    }
}
