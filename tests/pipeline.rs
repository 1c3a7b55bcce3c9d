//! End-to-end runs of the network-facing pipeline stages against in-process
//! mock services (embedding endpoint, Elasticsearch, model hub, completions,
//! chat).

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use repoa::chat::{AzureChatClient, ChatCompleter, ChatMessage, ChatSession, IndexRetriever};
use repoa::config::{
    AppSettings, ChatConfig, EmbeddingsConfig, IndexConfig, KeygenConfig, ModelConfig,
};
use repoa::download::{download_model, HubClient};
use repoa::elastic::ElasticClient;
use repoa::embed_cmd::run_embed;
use repoa::embedding::{AzureEmbeddingClient, Embedder};
use repoa::generate::{CompletionClient, DecodingParams, TextGenerator};
use repoa::indexer::run_index;
use repoa::keygen::{rotate_api_key, KeyRotationOutcome};
use repoa::models::EmbeddingDocument;
use repoa::responder::Responder;
use repoa::search::semantic_search;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ embedding service ============

#[derive(Default)]
struct EmbedState {
    inputs: Vec<String>,
    keys: Vec<String>,
}

/// Returns `[len, 1.0]` for each input; inputs containing `FAIL` get a 500.
async fn embed_handler(
    State(state): State<Arc<Mutex<EmbedState>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let input = body["input"].as_str().unwrap_or_default().to_string();
    {
        let mut s = state.lock().unwrap();
        s.keys.push(
            headers
                .get("api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        );
        s.inputs.push(input.clone());
    }
    if input.contains("FAIL") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "boom"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"data": [{"embedding": [input.len() as f32, 1.0]}]})),
    )
}

async fn embedding_server() -> (String, Arc<Mutex<EmbedState>>) {
    let state = Arc::new(Mutex::new(EmbedState::default()));
    let app = Router::new()
        .route("/embeddings", post(embed_handler))
        .with_state(state.clone());
    let base = serve(app).await;
    (format!("{}/embeddings", base), state)
}

#[tokio::test]
async fn embed_writes_one_document_per_file_and_records_failures() {
    let (endpoint, state) = embedding_server().await;
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("repo");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(root.join("src/a.cs"), "class A {}").unwrap();
    fs::write(root.join("b.txt"), "FAIL here").unwrap();
    fs::write(root.join("bin/skipped.dll"), "binary").unwrap();
    fs::write(root.join("appsettings.json"), "{}").unwrap();

    let config = EmbeddingsConfig {
        root: root.clone(),
        output_dir: tmp.path().join("out"),
        ..Default::default()
    };
    let embedder = AzureEmbeddingClient::new(endpoint, "k1".into(), Some(5)).unwrap();

    let summary = run_embed(&config, &embedder).await.unwrap();
    assert_eq!(summary.written(), 1);
    assert_eq!(summary.failed(), 1);

    let doc: EmbeddingDocument = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("out/src__a.cs.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(doc.file_name, "a.cs");
    assert_eq!(doc.path, "src/a.cs");
    assert_eq!(doc.content, "class A {}");
    assert_eq!(doc.embedding, vec![10.0, 1.0]);
    assert!(!tmp.path().join("out/b.txt.json").exists());

    let s = state.lock().unwrap();
    assert_eq!(s.inputs.len(), 2);
    assert!(s.keys.iter().all(|k| k == "k1"));
}

#[tokio::test]
async fn embed_keeps_same_named_files_apart() {
    let (endpoint, _) = embedding_server().await;
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("repo");
    fs::create_dir_all(root.join("a")).unwrap();
    fs::create_dir_all(root.join("x")).unwrap();
    fs::write(root.join("a/b.cs"), "class AB {}").unwrap();
    fs::write(root.join("x/b.cs"), "class XB {}").unwrap();
    // flattens to the same name as a/b.cs
    fs::write(root.join("a__b.cs"), "class Flat {}").unwrap();

    let out = tmp.path().join("out");
    let config = EmbeddingsConfig {
        root,
        output_dir: out.clone(),
        ..Default::default()
    };
    let embedder = AzureEmbeddingClient::new(endpoint, "k".into(), None).unwrap();
    let summary = run_embed(&config, &embedder).await.unwrap();
    assert_eq!(summary.written(), 3);

    let mut names: Vec<String> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&"a__b.cs.json".to_string()));
    assert!(names.contains(&"x__b.cs.json".to_string()));

    let mut paths: Vec<String> = names
        .iter()
        .map(|n| {
            let doc: EmbeddingDocument =
                serde_json::from_str(&fs::read_to_string(out.join(n)).unwrap()).unwrap();
            doc.path
        })
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["a/b.cs", "a__b.cs", "x/b.cs"]);
}

// ============ Elasticsearch ============

#[derive(Default)]
struct EsState {
    exists: bool,
    created_with: Option<Value>,
    bulk_calls: usize,
    bulk_lines: Vec<String>,
    auth: Vec<String>,
    search_bodies: Vec<Value>,
}

type Es = Arc<Mutex<EsState>>;

fn record_auth(state: &Es, headers: &HeaderMap) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.lock().unwrap().auth.push(auth);
}

async fn es_root(State(state): State<Es>, headers: HeaderMap) -> Json<Value> {
    record_auth(&state, &headers);
    Json(json!({"cluster_name": "mock", "tagline": "You Know, for Search"}))
}

async fn es_head(State(state): State<Es>, AxumPath(_index): AxumPath<String>) -> StatusCode {
    if state.lock().unwrap().exists {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn es_create(
    State(state): State<Es>,
    AxumPath(_index): AxumPath<String>,
    body: Bytes,
) -> Json<Value> {
    let mut s = state.lock().unwrap();
    s.exists = true;
    s.created_with = Some(serde_json::from_slice(&body).unwrap_or(Value::Null));
    Json(json!({"acknowledged": true}))
}

async fn es_bulk(State(state): State<Es>, body: String) -> Json<Value> {
    let mut s = state.lock().unwrap();
    s.bulk_calls += 1;
    let lines: Vec<String> = body.lines().map(|l| l.to_string()).collect();
    let items: Vec<Value> = (0..lines.len() / 2)
        .map(|_| json!({"index": {"status": 201}}))
        .collect();
    s.bulk_lines.extend(lines);
    Json(json!({"took": 1, "errors": false, "items": items}))
}

async fn es_search(
    State(state): State<Es>,
    AxumPath(_index): AxumPath<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.lock().unwrap().search_bodies.push(body);
    Json(json!({
        "hits": {
            "hits": [
                {"_score": 1.9, "_source": {"path": "src/a.cs", "file_name": "a.cs", "content": "class A {}"}},
                {"_score": 1.2, "_source": {"path": "src/b.cs", "file_name": "b.cs"}}
            ]
        }
    }))
}

async fn elastic_server(exists: bool) -> (String, Es) {
    let state = Arc::new(Mutex::new(EsState {
        exists,
        ..Default::default()
    }));
    let app = Router::new()
        .route("/", get(es_root))
        .route("/_bulk", post(es_bulk))
        .route("/{index}", axum::routing::head(es_head).put(es_create))
        .route("/{index}/_search", post(es_search))
        .with_state(state.clone());
    (serve(app).await, state)
}

fn write_document(dir: &std::path::Path, name: &str) {
    let doc = EmbeddingDocument {
        file_name: name.to_string(),
        path: format!("src/{}", name),
        content: format!("// {}", name),
        embedding: vec![0.25, 0.5],
    };
    fs::write(
        dir.join(format!("src__{}.json", name)),
        serde_json::to_string(&doc).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn index_creates_missing_index_and_uploads_in_one_bulk_call() {
    let (base, state) = elastic_server(false).await;
    let tmp = TempDir::new().unwrap();
    write_document(tmp.path(), "a.cs");
    write_document(tmp.path(), "b.cs");
    fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
    fs::write(tmp.path().join("notes.md"), "ignored").unwrap();

    let client = ElasticClient::new(base, "secret".into()).unwrap();
    let config = IndexConfig {
        embedding_dims: Some(2),
        ..Default::default()
    };
    let run = run_index(&client, &config, tmp.path()).await.unwrap();

    assert!(run.reachable);
    assert!(run.index_created);
    assert_eq!(run.loaded.failed(), 1);
    let bulk = run.bulk.unwrap();
    assert_eq!(bulk.submitted, 2);
    assert_eq!(bulk.succeeded, 2);

    let s = state.lock().unwrap();
    assert_eq!(s.bulk_calls, 1);
    assert_eq!(s.bulk_lines.len(), 4);
    let meta: Value = serde_json::from_str(&s.bulk_lines[0]).unwrap();
    assert_eq!(meta["index"]["_index"], "codebase_index_v2");
    let source: Value = serde_json::from_str(&s.bulk_lines[1]).unwrap();
    assert_eq!(source["path"], "src/a.cs");
    assert_eq!(
        s.created_with.as_ref().unwrap()["mappings"]["properties"]["embedding"]["dims"],
        2
    );
    assert!(s.auth.iter().all(|a| a == "ApiKey secret"));
}

#[tokio::test]
async fn index_with_no_documents_skips_bulk() {
    let (base, state) = elastic_server(true).await;
    let tmp = TempDir::new().unwrap();

    let client = ElasticClient::new(base, "secret".into()).unwrap();
    let run = run_index(&client, &IndexConfig::default(), tmp.path())
        .await
        .unwrap();

    assert!(!run.index_created);
    assert!(run.bulk.is_none());
    let s = state.lock().unwrap();
    assert_eq!(s.bulk_calls, 0);
    assert!(s.created_with.is_none());
}

#[tokio::test]
async fn search_embeds_query_and_scores_by_cosine() {
    let (embed_endpoint, _) = embedding_server().await;
    let (base, state) = elastic_server(true).await;

    let client = ElasticClient::new(base, "secret".into()).unwrap();
    let embedder = AzureEmbeddingClient::new(embed_endpoint, "k".into(), None).unwrap();
    let hits = semantic_search(&client, &embedder, "codebase_index_v2", "abc", 2)
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "src/a.cs");
    let s = state.lock().unwrap();
    let body = &s.search_bodies[0];
    assert_eq!(body["size"], 2);
    assert_eq!(
        body["query"]["script_score"]["script"]["params"]["query_vector"],
        json!([3.0, 1.0])
    );
}

// ============ key rotation ============

async fn keygen_handler(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    // "elastic:changeme"
    if auth != "Basic ZWxhc3RpYzpjaGFuZ2VtZQ==" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": "abc",
            "name": body["name"],
            "expiration": 1,
            "api_key": "xyz",
            "encoded": "YWJjOnh5eg=="
        })),
    )
}

fn keygen_settings(url: &str, password: &str) -> AppSettings {
    let mut settings = AppSettings::default();
    settings.elastic_search.regenerate_api_key_endpoint = Some(url.to_string());
    settings.elastic_search.username = Some("elastic".into());
    settings.elastic_search.password = Some(password.to_string());
    settings
}

#[tokio::test]
async fn rotate_key_created_and_rejected() {
    let app = Router::new().route("/_security/api_key", post(keygen_handler));
    let base = serve(app).await;
    let url = format!("{}/_security/api_key", base);

    let outcome = rotate_api_key(&keygen_settings(&url, "changeme"), &KeygenConfig::default())
        .await
        .unwrap();
    match outcome {
        KeyRotationOutcome::Created(body) => {
            assert_eq!(body["name"], "my_api_key");
            assert_eq!(body["encoded"], "YWJjOnh5eg==");
        }
        other => panic!("expected Created, got {:?}", other),
    }

    let outcome = rotate_api_key(&keygen_settings(&url, "wrong"), &KeygenConfig::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        KeyRotationOutcome::Rejected { status: 401, .. }
    ));
}

// ============ model hub ============

#[derive(Default)]
struct HubState {
    files: HashMap<String, Vec<u8>>,
    hits: HashMap<String, usize>,
    auth: Vec<String>,
}

type Hub = Arc<Mutex<HubState>>;

async fn hub_file(
    State(state): State<Hub>,
    AxumPath((_org, _name, _rev, file)): AxumPath<(String, String, String, String)>,
    headers: HeaderMap,
) -> (StatusCode, Vec<u8>) {
    let mut s = state.lock().unwrap();
    s.auth.push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );
    *s.hits.entry(file.clone()).or_default() += 1;
    match s.files.get(&file) {
        Some(body) => (StatusCode::OK, body.clone()),
        None => (StatusCode::NOT_FOUND, b"Entry not found".to_vec()),
    }
}

async fn hub_server(files: &[(&str, &str)]) -> (ModelConfig, Hub) {
    let state = Arc::new(Mutex::new(HubState {
        files: files
            .iter()
            .map(|(name, body)| (name.to_string(), body.as_bytes().to_vec()))
            .collect(),
        ..Default::default()
    }));
    let app = Router::new()
        .route("/{org}/{name}/resolve/{rev}/{*file}", get(hub_file))
        .with_state(state.clone());
    let base = serve(app).await;
    let config = ModelConfig {
        repo: "acme/tiny-llm".into(),
        revision: "main".into(),
        hub_url: base,
        ..Default::default()
    };
    (config, state)
}

fn part_files(dir: &std::path::Path) -> Vec<String> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".part"))
        .collect()
}

#[tokio::test]
async fn download_fetches_sharded_model_once() {
    let index = json!({
        "metadata": {"total_size": 8},
        "weight_map": {
            "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
            "model.norm.weight": "model-00002-of-00002.safetensors",
            "lm_head.weight": "model-00002-of-00002.safetensors"
        }
    })
    .to_string();
    let (config, state) = hub_server(&[
        ("config.json", r#"{"model_type":"llama"}"#),
        ("tokenizer.json", "{}"),
        ("tokenizer_config.json", "{}"),
        ("model.safetensors.index.json", index.as_str()),
        ("model-00001-of-00002.safetensors", "aaaa"),
        ("model-00002-of-00002.safetensors", "bbbb"),
    ])
    .await;

    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("downloaded_model");
    fs::create_dir_all(&dest).unwrap();
    fs::write(dest.join("tokenizer.json"), "local").unwrap();

    let hub = HubClient::new(&config, Some("hf_secret".into())).unwrap();
    let report = download_model(&hub, &dest).await.unwrap();

    assert_eq!(report.fetched.len(), 5);
    assert_eq!(report.cached, vec![dest.join("tokenizer.json")]);
    assert_eq!(
        report.missing_optional,
        vec!["special_tokens_map.json", "generation_config.json"]
    );
    assert_eq!(fs::read(dest.join("model-00002-of-00002.safetensors")).unwrap(), b"bbbb");
    assert_eq!(fs::read_to_string(dest.join("tokenizer.json")).unwrap(), "local");
    assert!(part_files(&dest).is_empty());

    {
        let s = state.lock().unwrap();
        assert_eq!(s.hits.get("tokenizer.json"), None);
        assert_eq!(s.hits["model-00001-of-00002.safetensors"], 1);
        assert_eq!(s.hits["model-00002-of-00002.safetensors"], 1);
        assert!(!s.hits.contains_key("model.safetensors"));
        assert!(s.auth.iter().all(|a| a == "Bearer hf_secret"));
    }

    // a second run only re-checks the optional files that were missing
    let again = download_model(&hub, &dest).await.unwrap();
    assert!(again.fetched.is_empty());
    assert_eq!(again.cached.len(), 6);
    let s = state.lock().unwrap();
    assert_eq!(s.hits["model-00001-of-00002.safetensors"], 1);
    assert_eq!(s.hits["config.json"], 1);
}

#[tokio::test]
async fn download_falls_back_to_single_weights_file() {
    let (config, state) = hub_server(&[
        ("config.json", "{}"),
        ("tokenizer.json", "{}"),
        ("model.safetensors", "weights"),
    ])
    .await;
    let tmp = TempDir::new().unwrap();

    let hub = HubClient::new(&config, None).unwrap();
    let report = download_model(&hub, tmp.path()).await.unwrap();

    assert_eq!(report.fetched.len(), 3);
    assert_eq!(report.missing_optional.len(), 3);
    assert_eq!(fs::read(tmp.path().join("model.safetensors")).unwrap(), b"weights");
    assert!(part_files(tmp.path()).is_empty());
    assert!(state.lock().unwrap().auth.iter().all(|a| a.is_empty()));
}

#[tokio::test]
async fn download_missing_required_file_is_an_error() {
    let (config, _) = hub_server(&[("config.json", "{}"), ("model.safetensors", "w")]).await;
    let tmp = TempDir::new().unwrap();

    let hub = HubClient::new(&config, None).unwrap();
    let err = download_model(&hub, tmp.path()).await.unwrap_err();
    assert!(err.to_string().contains("tokenizer.json"), "{}", err);
    assert!(!tmp.path().join("tokenizer.json").exists());
}

// ============ completions / responder ============

async fn completions_handler(
    State(seen): State<Arc<Mutex<Vec<Value>>>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
    seen.lock().unwrap().push(body);
    Json(json!({"choices": [{"text": format!("{} It parses the config.", prompt)}]}))
}

#[tokio::test]
async fn responder_strips_echoed_prompt() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/v1/completions", post(completions_handler))
        .with_state(seen.clone());
    let base = serve(app).await;

    let generator =
        CompletionClient::new(format!("{}/v1/completions", base), Some("ft".into()), None).unwrap();
    let params = DecodingParams {
        max_length: 100,
        temperature: 0.7,
        top_k: 50,
        top_p: 0.95,
    };
    let responder = Responder::new(&generator, None, params.clone(), vec!["exit".into()])
        .with_prompt(false);

    let mut out = Vec::new();
    let turns = responder
        .run("What does Config do?\nexit\n".as_bytes(), &mut out)
        .await
        .unwrap();
    assert_eq!(turns, 1);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Model: It parses the config.\n"
    );

    let raw = generator.generate("hi", 5, &params).await.unwrap();
    assert_eq!(raw, "hi It parses the config.");

    let bodies = seen.lock().unwrap();
    assert_eq!(bodies[0]["model"], "ft");
    assert_eq!(bodies[0]["max_tokens"], 100);
    assert_eq!(bodies[0]["echo"], true);
    assert_eq!(bodies[1]["max_tokens"], 5);
}

// ============ project chat ============

async fn chat_handler(
    State(seen): State<Arc<Mutex<Vec<Value>>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if headers.get("api-key").and_then(|v| v.to_str().ok()) != Some("chat-key") {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    seen.lock().unwrap().push(body);
    (
        StatusCode::OK,
        Json(json!({"choices": [{"message": {"role": "assistant", "content": "It is a class."}}]})),
    )
}

#[tokio::test]
async fn chat_turn_sends_context_and_cleaned_messages() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/chat", post(chat_handler))
        .with_state(seen.clone());
    let chat_base = serve(app).await;
    let (embed_endpoint, _) = embedding_server().await;
    let (es_base, _) = elastic_server(true).await;

    let config = ChatConfig::default();
    let completer =
        AzureChatClient::new(format!("{}/chat", chat_base), "chat-key".into(), &config).unwrap();
    let client = ElasticClient::new(es_base, "secret".into()).unwrap();
    let embedder = AzureEmbeddingClient::new(embed_endpoint, "k".into(), None).unwrap();
    let retriever = IndexRetriever {
        client: &client,
        embedder: &embedder,
        index: "codebase_index_v2".into(),
        size: 2,
    };

    let mut session = ChatSession::new(&config);
    let answer = session
        .ask("What is \"A\"?\n", &retriever, &completer)
        .await
        .unwrap();
    assert_eq!(answer, "It is a class.");

    let bodies = seen.lock().unwrap();
    let body = &bodies[0];
    assert_eq!(body["model"], "gpt-35-turbo");
    assert_eq!(body["max_tokens"], 500);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "What is 'A'?");
    assert_eq!(messages[2]["content"], "Project context: class A {}");
}

#[tokio::test]
async fn chat_rejected_key_is_an_error() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/chat", post(chat_handler))
        .with_state(seen);
    let base = serve(app).await;

    let completer =
        AzureChatClient::new(format!("{}/chat", base), "wrong".into(), &ChatConfig::default())
            .unwrap();
    let err = completer
        .complete(&[ChatMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"));
}

#[tokio::test]
async fn embedder_reports_server_errors() {
    let (endpoint, _) = embedding_server().await;
    let embedder = AzureEmbeddingClient::new(endpoint, "k".into(), None).unwrap();
    assert!(embedder.embed("FAIL").await.is_err());
    assert_eq!(embedder.embed("ok").await.unwrap(), vec![2.0, 1.0]);
}
