//! OpenAPI 3 adapter: one MCP tool per `operationId`. Tool calls map back
//! to `METHOD path` with path/query/body parameter placement; non-2xx
//! responses become tool results with `is_error = true`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use serde_json::{Map, Value, json};

use gridctl_core::GatewayError;
use gridctl_core::protocol::CallToolResult;
use gridctl_core::types::ToolDescriptor;
use gridctl_config::OpenApiConfig;
use gridctl_config::expand;

use super::{CallTimeouts, UpstreamBase};

#[derive(Debug)]
pub struct OpenApiUpstream {
    base: UpstreamBase,
    config: OpenApiConfig,
    client: reqwest::Client,
    operations: std::sync::RwLock<HashMap<String, Operation>>,
    base_url: std::sync::RwLock<String>,
    loaded: AtomicBool,
    timeouts: CallTimeouts,
}

#[derive(Debug, Clone)]
struct Operation {
    method: String,
    path: String,
    params: Vec<ParamSpec>,
    accepts_body: bool,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
}

// Minimal slice of an OpenAPI 3 document: enough to synthesize tools.
#[derive(Debug, Deserialize)]
struct OpenApiDoc {
    #[serde(default)]
    servers: Vec<ServerObject>,
    #[serde(default)]
    paths: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ServerObject {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OperationObject {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterObject>,
    #[serde(rename = "requestBody")]
    request_body: Option<RequestBodyObject>,
}

#[derive(Debug, Deserialize)]
struct ParameterObject {
    name: String,
    #[serde(rename = "in")]
    location: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    description: String,
    #[serde(default = "default_schema")]
    schema: Value,
}

#[derive(Debug, Deserialize)]
struct RequestBodyObject {
    #[serde(default)]
    required: bool,
    #[serde(default)]
    content: BTreeMap<String, MediaTypeObject>,
}

#[derive(Debug, Deserialize)]
struct MediaTypeObject {
    #[serde(default = "default_schema")]
    schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object"})
}

const HTTP_METHODS: [&str; 7] = ["get", "put", "post", "delete", "options", "head", "patch"];

impl OpenApiUpstream {
    pub fn new(
        name: &str,
        config: OpenApiConfig,
        whitelist: Vec<String>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            base: UpstreamBase::new(name, whitelist),
            config,
            client: reqwest::Client::new(),
            operations: std::sync::RwLock::new(HashMap::new()),
            base_url: std::sync::RwLock::new(String::new()),
            loaded: AtomicBool::new(false),
            timeouts,
        }
    }

    pub fn base(&self) -> &UpstreamBase {
        &self.base
    }

    /// Load the spec document and synthesize the tool catalog.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let _guard = self.base.init_guard().await;
        if self.base.is_initialized() {
            return Ok(());
        }
        self.load_spec().await?;
        self.base.set_initialized(true);
        tracing::info!(
            server = %self.base.name(),
            spec = %self.config.spec,
            tools = self.operations.read().unwrap_or_else(|e| e.into_inner()).len(),
            "openapi upstream initialized"
        );
        Ok(())
    }

    pub async fn refresh_tools(&self) -> Result<std::sync::Arc<Vec<ToolDescriptor>>, GatewayError> {
        self.load_spec().await?;
        Ok(self.base.cached_tools())
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        let url = self.base_url.read().unwrap_or_else(|e| e.into_inner()).clone();
        if url.is_empty() {
            // Spec never loaded; nothing to probe yet.
            return if self.loaded.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(GatewayError::transport(self.base.name(), "spec not loaded"))
            };
        }

        // Any HTTP response at all proves the API host is reachable.
        tokio::time::timeout(self.timeouts.ping, self.client.get(&url).send())
            .await
            .map_err(|_| GatewayError::transport(self.base.name(), "ping timed out"))?
            .map(|_| ())
            .map_err(|error| {
                GatewayError::transport(self.base.name(), format_args!("ping failed: {error}"))
            })
    }

    pub async fn tools_call(&self, name: &str, args: Value) -> Result<CallToolResult, GatewayError> {
        let operation = {
            let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
            operations.get(name).cloned()
        }
        .ok_or_else(|| GatewayError::NotFound(format!("unknown operation '{name}'")))?;

        let args = args.as_object().cloned().unwrap_or_default();

        // Path parameters are mandatory by construction; reject before
        // issuing the HTTP call.
        let mut path = operation.path.clone();
        for param in operation.params.iter().filter(|p| p.location == ParamLocation::Path) {
            let Some(value) = args.get(&param.name) else {
                return Ok(CallToolResult::error(format!(
                    "missing required parameter '{}'",
                    param.name
                )));
            };
            let rendered = render_param(value);
            path = path.replace(
                &format!("{{{}}}", param.name),
                &urlencoding::encode(&rendered),
            );
        }

        let base_url = self.base_url.read().unwrap_or_else(|e| e.into_inner()).clone();
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);

        let method = reqwest::Method::from_bytes(operation.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::Internal(format!("bad method '{}'", operation.method)))?;
        let mut request = self.client.request(method, &url);

        for param in operation.params.iter().filter(|p| p.location == ParamLocation::Query) {
            if let Some(value) = args.get(&param.name) {
                request = request.query(&[(param.name.as_str(), render_param(value))]);
            } else if param.required {
                return Ok(CallToolResult::error(format!(
                    "missing required parameter '{}'",
                    param.name
                )));
            }
        }

        if operation.accepts_body {
            if let Some(body) = args.get("body") {
                request = request.json(body);
            }
        }

        if let Some(auth) = &self.config.auth {
            request = request.header("Authorization", auth);
        }

        let response = tokio::time::timeout(self.timeouts.call, request.send())
            .await
            .map_err(|_| {
                GatewayError::transport(
                    self.base.name(),
                    format_args!("call timed out after {}s", self.timeouts.call.as_secs()),
                )
            })?
            .map_err(|error| {
                GatewayError::transport(self.base.name(), format_args!("request failed: {error}"))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(CallToolResult::text(body))
        } else {
            Ok(CallToolResult::error(format!("HTTP {status}: {body}")))
        }
    }

    async fn load_spec(&self) -> Result<(), GatewayError> {
        let raw = self.fetch_spec_text().await?;
        let raw = if self.config.no_expand {
            raw
        } else {
            expand::expand_str(&raw)
        };

        let doc: OpenApiDoc = parse_spec(&raw).map_err(|error| {
            GatewayError::Configuration(format!(
                "server '{}': invalid OpenAPI spec: {error}",
                self.base.name()
            ))
        })?;

        let base_url = match &self.config.base_url {
            Some(url) => url.clone(),
            None => doc
                .servers
                .first()
                .map(|server| server.url.clone())
                .ok_or_else(|| {
                    GatewayError::Configuration(format!(
                        "server '{}': OpenAPI spec has no servers and no base_url configured",
                        self.base.name()
                    ))
                })?,
        };

        let mut operations = HashMap::new();
        let mut tools = Vec::new();
        for (path, methods) in &doc.paths {
            for (method, raw_op) in methods {
                if !HTTP_METHODS.contains(&method.as_str()) {
                    continue;
                }
                let Ok(op) = serde_json::from_value::<OperationObject>(raw_op.clone()) else {
                    continue;
                };
                let Some(operation_id) = op.operation_id.clone() else {
                    continue;
                };
                if !included(&self.config.include, &self.config.exclude, &operation_id) {
                    continue;
                }

                let (operation, tool) = synthesize(path, method, &operation_id, &op);
                operations.insert(operation_id, operation);
                tools.push(tool);
            }
        }

        tools.sort_by(|a, b| a.name.cmp(&b.name));
        self.base.store_tools(tools);
        *self.operations.write().unwrap_or_else(|e| e.into_inner()) = operations;
        *self.base_url.write().unwrap_or_else(|e| e.into_inner()) = base_url;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn fetch_spec_text(&self) -> Result<String, GatewayError> {
        let spec = &self.config.spec;
        if spec.starts_with("http://") || spec.starts_with("https://") {
            let response = self.client.get(spec).send().await.map_err(|error| {
                GatewayError::transport(
                    self.base.name(),
                    format_args!("failed to fetch spec {spec}: {error}"),
                )
            })?;
            response.text().await.map_err(|error| {
                GatewayError::transport(
                    self.base.name(),
                    format_args!("failed to read spec {spec}: {error}"),
                )
            })
        } else {
            std::fs::read_to_string(spec).map_err(|error| {
                GatewayError::Configuration(format!(
                    "server '{}': failed to read spec {spec}: {error}",
                    self.base.name()
                ))
            })
        }
    }
}

/// OpenAPI documents come as YAML or JSON; YAML parses both.
fn parse_spec(raw: &str) -> Result<OpenApiDoc, String> {
    serde_yaml::from_str(raw).map_err(|error| error.to_string())
}

fn included(include: &[String], exclude: &[String], operation_id: &str) -> bool {
    if !include.is_empty() && !include.iter().any(|inc| inc == operation_id) {
        return false;
    }
    !exclude.iter().any(|exc| exc == operation_id)
}

/// Build the routing entry and the synthesized tool for one operation.
/// The input schema is the union of path and query parameters plus the
/// request body under a `body` key.
fn synthesize(
    path: &str,
    method: &str,
    operation_id: &str,
    op: &OperationObject,
) -> (Operation, ToolDescriptor) {
    let mut params = Vec::new();
    let mut properties = Map::new();
    let mut required = Vec::new();

    for parameter in &op.parameters {
        let location = match parameter.location.as_str() {
            "path" => ParamLocation::Path,
            "query" => ParamLocation::Query,
            _ => continue,
        };
        // Path parameters are always required per the OpenAPI spec.
        let is_required = parameter.required || location == ParamLocation::Path;

        let mut schema = parameter.schema.clone();
        if !parameter.description.is_empty() {
            if let Some(obj) = schema.as_object_mut() {
                obj.entry("description")
                    .or_insert_with(|| Value::String(parameter.description.clone()));
            }
        }
        properties.insert(parameter.name.clone(), schema);
        if is_required {
            required.push(Value::String(parameter.name.clone()));
        }

        params.push(ParamSpec {
            name: parameter.name.clone(),
            location,
            required: is_required,
        });
    }

    let accepts_body = op.request_body.is_some();
    if let Some(body) = &op.request_body {
        let schema = body
            .content
            .get("application/json")
            .or_else(|| body.content.values().next())
            .map(|media| media.schema.clone())
            .unwrap_or_else(default_schema);
        properties.insert("body".to_string(), schema);
        if body.required {
            required.push(Value::String("body".to_string()));
        }
    }

    let mut input_schema = json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        input_schema["required"] = Value::Array(required);
    }

    let description = if op.description.is_empty() {
        if op.summary.is_empty() {
            format!("{} {}", method.to_ascii_uppercase(), path)
        } else {
            op.summary.clone()
        }
    } else {
        op.description.clone()
    };

    let operation = Operation {
        method: method.to_string(),
        path: path.to_string(),
        params,
        accepts_body,
    };
    let tool = ToolDescriptor {
        name: operation_id.to_string(),
        description,
        input_schema,
    };
    (operation, tool)
}

fn render_param(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PETSTORE: &str = r#"
openapi: "3.0.0"
info:
  title: items
  version: "1.0"
servers:
  - url: http://127.0.0.1:9000
paths:
  /items/{id}:
    get:
      operationId: getItem
      summary: Fetch one item
      parameters:
        - name: id
          in: path
          required: true
          schema:
            type: string
        - name: verbose
          in: query
          schema:
            type: boolean
  /items:
    post:
      operationId: createItem
      requestBody:
        required: true
        content:
          application/json:
            schema:
              type: object
    ignored: not-a-method
"#;

    fn upstream_with_spec(dir: &std::path::Path, config_mut: impl FnOnce(&mut OpenApiConfig)) -> OpenApiUpstream {
        let spec_path = dir.join("api.yaml");
        std::fs::write(&spec_path, PETSTORE).unwrap();
        let mut config = OpenApiConfig {
            spec: spec_path.to_string_lossy().into_owned(),
            ..OpenApiConfig::default()
        };
        config_mut(&mut config);
        OpenApiUpstream::new("api", config, vec![], CallTimeouts::default())
    }

    #[tokio::test]
    async fn synthesizes_one_tool_per_operation_id() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream_with_spec(dir.path(), |_| {});
        upstream.initialize().await.unwrap();

        let tools = upstream.base().cached_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["createItem", "getItem"]);

        let get_item = tools.iter().find(|t| t.name == "getItem").unwrap();
        assert_eq!(get_item.description, "Fetch one item");
        assert!(get_item.input_schema["properties"]["id"].is_object());
        assert!(get_item.input_schema["properties"]["verbose"].is_object());
        assert_eq!(get_item.input_schema["required"][0], "id");

        let create = tools.iter().find(|t| t.name == "createItem").unwrap();
        assert!(create.input_schema["properties"]["body"].is_object());
    }

    #[tokio::test]
    async fn include_exclude_filters_narrow_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream_with_spec(dir.path(), |config| {
            config.exclude = vec!["createItem".to_string()];
        });
        upstream.initialize().await.unwrap();
        let tools = upstream.base().cached_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "getItem");
    }

    #[tokio::test]
    async fn missing_path_param_is_rejected_before_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream_with_spec(dir.path(), |_| {});
        upstream.initialize().await.unwrap();

        let result = upstream.tools_call("getItem", json!({})).await.unwrap();
        assert!(result.is_error);
        match &result.content[0] {
            gridctl_core::protocol::ToolContent::Text { text } => {
                assert!(text.contains("id"), "error should mention the parameter: {text}");
            }
        }
    }

    #[tokio::test]
    async fn env_placeholders_expand_unless_suppressed() {
        // SAFETY: test-scoped env mutation; no other test reads this name.
        unsafe { std::env::set_var("GRIDCTL_OPENAPI_TEST_HOST", "expanded.example.com") };

        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("api.yaml");
        std::fs::write(
            &spec_path,
            "openapi: \"3.0.0\"\nservers:\n  - url: http://${GRIDCTL_OPENAPI_TEST_HOST}\npaths: {}\n",
        )
        .unwrap();

        let expanded = OpenApiUpstream::new(
            "api",
            OpenApiConfig {
                spec: spec_path.to_string_lossy().into_owned(),
                ..OpenApiConfig::default()
            },
            vec![],
            CallTimeouts::default(),
        );
        expanded.initialize().await.unwrap();
        assert_eq!(
            *expanded.base_url.read().unwrap(),
            "http://expanded.example.com"
        );

        let suppressed = OpenApiUpstream::new(
            "api",
            OpenApiConfig {
                spec: spec_path.to_string_lossy().into_owned(),
                no_expand: true,
                ..OpenApiConfig::default()
            },
            vec![],
            CallTimeouts::default(),
        );
        suppressed.initialize().await.unwrap();
        assert_eq!(
            *suppressed.base_url.read().unwrap(),
            "http://${GRIDCTL_OPENAPI_TEST_HOST}"
        );
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let upstream = OpenApiUpstream::new(
            "api",
            OpenApiConfig::default(),
            vec![],
            CallTimeouts::default(),
        );
        let err = upstream.tools_call("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
