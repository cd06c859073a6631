//! The config hub: a tool agent over the discovery store that endpoints
//! announce themselves to and callers search.

use crate::tool::{FunctionTool, Tool};
use aip_types::discovery::{
    DiscoveryStore, RecordFilter, ServerConfig, ServerRecord, ServerState, RECORD_TYPE_TOOL,
};
use aip_types::error::{AipError, AipResult};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub const CONFIG_HUB_DESCRIPTION: &str = "This is a config hub, which can manage your agent or tool configuration.\n\
You can register your agent or tool in the hub.\n\
You can find agents or tools you want to use.\n";

fn default_num_results() -> usize {
    5
}

/// Arguments of `search_server_config`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    #[serde(default)]
    pub metadata_filter: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub content_filter: Option<String>,
}

/// Insert or replace the record for `name`.
///
/// `last_seen` defaults to now; a record arriving as `stopped` gets its
/// `stopped_at` stamped.
pub async fn register_server(
    store: &dyn DiscoveryStore,
    name: &str,
    description: &str,
    config: serde_json::Value,
) -> AipResult<ServerRecord> {
    if name.trim().is_empty() {
        return Err(AipError::Store("Server name must not be empty".into()));
    }
    let mut config: ServerConfig = serde_json::from_value(config)
        .map_err(|e| AipError::Store(format!("Invalid server config: {e}")))?;
    let now = Utc::now();
    config.last_seen.get_or_insert(now);
    match config.state {
        ServerState::Stopped => {
            config.stopped_at.get_or_insert(now);
        }
        ServerState::Running => config.stopped_at = None,
    }

    let record = ServerRecord {
        name: name.to_string(),
        description: description.to_string(),
        config,
    };
    store.upsert(record.clone()).await?;
    info!(server = %name, state = %record.config.state, "Server registered");
    Ok(record)
}

/// Running records ranked by how many query terms they mention.
///
/// Only `state = running` is ever returned; `type` defaults to `tool` unless
/// the metadata filter names another one.
pub async fn search_server_config(
    store: &dyn DiscoveryStore,
    request: &SearchRequest,
) -> AipResult<Vec<serde_json::Value>> {
    let mut filter = RecordFilter {
        metadata: request.metadata_filter.clone().unwrap_or_default(),
        content: request.content_filter.clone(),
        ..RecordFilter::default()
    };
    filter
        .metadata
        .entry("type")
        .or_insert_with(|| json!(RECORD_TYPE_TOOL));
    filter
        .metadata
        .insert("state".into(), json!(ServerState::Running.to_string()));

    let terms: Vec<String> = request
        .query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    let mut scored: Vec<(usize, ServerRecord)> = store
        .query(&filter)
        .await?
        .into_iter()
        .filter_map(|record| {
            let haystack = format!("{} {}", record.name, record.description).to_lowercase();
            let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            (terms.is_empty() || score > 0).then_some((score, record))
        })
        .collect();
    // Stable sort keeps name order among equal scores.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(scored
        .into_iter()
        .take(request.num_results)
        .map(|(_, record)| {
            json!({
                "server_name": record.name,
                "description": record.description,
                "config": record.config,
            })
        })
        .collect())
}

/// The two tools a config hub exposes.
pub fn config_hub_tools(store: Arc<dyn DiscoveryStore>) -> Vec<Arc<dyn Tool>> {
    let register_store = Arc::clone(&store);
    let register: Arc<dyn Tool> = Arc::new(FunctionTool::new(
        "register_server",
        "Register a agent/tool server to the config hub.",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The agent/tool server name"},
                "description": {"type": "string", "description": "The agent/tool server description"},
                "config": {"type": "object", "description": "The agent/tool server config"}
            },
            "required": ["name", "description", "config"]
        }),
        move |args| {
            let store = Arc::clone(&register_store);
            async move {
                let name = args["name"].as_str().unwrap_or_default();
                let description = args["description"].as_str().unwrap_or_default();
                let record = register_server(store.as_ref(), name, description, args["config"].clone())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({
                    "name": record.name,
                    "state": record.config.state,
                }))
            }
        },
    ));

    let search: Arc<dyn Tool> = Arc::new(FunctionTool::new(
        "search_server_config",
        "Search for agent/tool servers similar to a query.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The query to search for"},
                "num_results": {"type": "integer", "description": "The number of results to return"},
                "metadata_filter": {"type": ["object", "null"], "description": "The metadata filter"},
                "content_filter": {"type": ["string", "null"], "description": "The content filter"}
            },
            "required": ["query"]
        }),
        move |args| {
            let store = Arc::clone(&store);
            async move {
                let request: SearchRequest =
                    serde_json::from_value(args).map_err(|e| e.to_string())?;
                let found = search_server_config(store.as_ref(), &request)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Array(found))
            }
        },
    ));

    vec![register, search]
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_memory::MemoryDiscoveryStore;

    fn tool_config(state: &str) -> serde_json::Value {
        json!({"type": "tool", "transport": "grpc", "state": state})
    }

    fn search(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            num_results: 5,
            metadata_filter: None,
            content_filter: None,
        }
    }

    #[tokio::test]
    async fn test_register_upserts_and_stamps() {
        let store = MemoryDiscoveryStore::new();
        let first = register_server(&store, "weather", "v1", tool_config("running"))
            .await
            .unwrap();
        assert!(first.config.last_seen.is_some());
        register_server(&store, "weather", "v2", tool_config("stopped"))
            .await
            .unwrap();

        let record = store.get("weather").await.unwrap().unwrap();
        assert_eq!(record.description, "v2");
        assert_eq!(record.config.state, ServerState::Stopped);
        assert!(record.config.stopped_at.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_register_accepts_timestamp_alias_and_extra_keys() {
        let store = MemoryDiscoveryStore::new();
        let record = register_server(
            &store,
            "weather",
            "",
            json!({"state": "running", "timestamp": "2024-05-01T10:00:00Z", "owner": "alice"}),
        )
        .await
        .unwrap();
        assert_eq!(
            record.config.last_seen.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert_eq!(record.config.extra["owner"], "alice");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_state() {
        let store = MemoryDiscoveryStore::new();
        let err = register_server(&store, "weather", "", json!({"state": "sleeping"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid server config"));
    }

    #[tokio::test]
    async fn test_search_excludes_stopped_and_non_tools() {
        let store = MemoryDiscoveryStore::new();
        register_server(&store, "weather", "weather forecasts", tool_config("running"))
            .await
            .unwrap();
        register_server(&store, "old_weather", "weather archive", tool_config("stopped"))
            .await
            .unwrap();
        register_server(
            &store,
            "weather_bot",
            "chat about weather",
            json!({"type": "agent", "state": "running"}),
        )
        .await
        .unwrap();

        let found = search_server_config(&store, &search("weather")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["server_name"], "weather");
        assert_eq!(found[0]["config"]["state"], "running");

        // The type default can be overridden, the state cannot.
        let mut agents = search("weather");
        agents.metadata_filter = Some(
            json!({"type": "agent", "state": "stopped"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let found = search_server_config(&store, &agents).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["server_name"], "weather_bot");
    }

    #[tokio::test]
    async fn test_search_ranks_by_matching_terms() {
        let store = MemoryDiscoveryStore::new();
        for (name, description) in [
            ("alpha", "stock quotes"),
            ("bravo", "weather and stock quotes"),
            ("charlie", "chess"),
        ] {
            register_server(&store, name, description, tool_config("running"))
                .await
                .unwrap();
        }
        let found = search_server_config(&store, &search("find weather stock tools"))
            .await
            .unwrap();
        let names: Vec<_> = found.iter().map(|r| r["server_name"].clone()).collect();
        assert_eq!(names, vec![json!("bravo"), json!("alpha")]);

        let mut limited = search("");
        limited.num_results = 2;
        assert_eq!(search_server_config(&store, &limited).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_content_filter() {
        let store = MemoryDiscoveryStore::new();
        register_server(&store, "a", "Uses SSE transport", tool_config("running"))
            .await
            .unwrap();
        register_server(&store, "b", "Uses grpc transport", tool_config("running"))
            .await
            .unwrap();
        let mut request = search("");
        request.content_filter = Some("SSE".into());
        let found = search_server_config(&store, &request).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["server_name"], "a");
    }

    #[tokio::test]
    async fn test_tools_through_dispatcher() {
        use crate::dispatcher::ToolDispatcher;
        use aip_types::tool::FunctionCall;
        use tokio_util::sync::CancellationToken;

        let store: Arc<dyn DiscoveryStore> = Arc::new(MemoryDiscoveryStore::new());
        let dispatcher =
            ToolDispatcher::new(CONFIG_HUB_DESCRIPTION, config_hub_tools(store.clone())).unwrap();
        let cancel = CancellationToken::new();

        let register = FunctionCall::new(
            "register_server",
            &json!({"name": "weather", "description": "forecasts", "config": tool_config("running")}),
        );
        let out = dispatcher.dispatch(&register, &cancel).await.unwrap().unwrap();
        assert_eq!(out.content, r#"{"name":"weather","state":"running"}"#);

        let find = FunctionCall::new(
            "search_server_config",
            &json!({"query": "forecasts", "metadata_filter": null}),
        );
        let out = dispatcher.dispatch(&find, &cancel).await.unwrap().unwrap();
        let found: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(found[0]["server_name"], "weather");
    }
}
