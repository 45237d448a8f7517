//! Data types for (a subset of) the Model Context Protocol, together with
//! the JSON-RPC 2.0 envelope it rides on.
//!
//! The broker only serves the server side of the protocol: `initialize`,
//! `ping`, `tools/list` and `tools/call`. Resource/prompt/completion
//! surfaces are intentionally absent; unknown methods are rejected by the
//! `ClientRequest` conversion so the server can answer with a proper
//! JSON-RPC error instead of panicking mid-dispatch.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_SCHEMA_VERSION: &str = "2025-03-26";

/// Request ids may be strings or integers on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// Standard JSON-RPC error codes used by the server.
pub const INVALID_REQUEST_ERROR_CODE: i64 = -32600;
pub const METHOD_NOT_FOUND_ERROR_CODE: i64 = -32601;
pub const INVALID_PARAMS_ERROR_CODE: i64 = -32602;
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// A typed MCP request: pairs a wire method name with its params/result
/// types so handlers can be written generically.
pub trait ModelContextProtocolRequest {
    const METHOD: &'static str;
    type Params: DeserializeOwned + Serialize + std::fmt::Debug;
    type Result: DeserializeOwned + Serialize + std::fmt::Debug;
}

#[derive(Debug)]
pub enum InitializeRequest {}

impl ModelContextProtocolRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

#[derive(Debug)]
pub enum PingRequest {}

impl ModelContextProtocolRequest for PingRequest {
    const METHOD: &'static str = "ping";
    type Params = Option<JsonValue>;
    type Result = JsonValue;
}

#[derive(Debug)]
pub enum ListToolsRequest {}

impl ModelContextProtocolRequest for ListToolsRequest {
    const METHOD: &'static str = "tools/list";
    type Params = Option<ListToolsRequestParams>;
    type Result = ListToolsResult;
}

#[derive(Debug)]
pub enum CallToolRequest {}

impl ModelContextProtocolRequest for CallToolRequest {
    const METHOD: &'static str = "tools/call";
    type Params = CallToolRequestParams;
    type Result = CallToolResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
    pub protocol_version: String,
}

/// Capability sets are open-ended objects in the MCP schema; the broker
/// does not branch on any of them, so they are kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: ServerCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub protocol_version: String,
    pub server_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ServerCapabilitiesTools>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilitiesTools {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListToolsRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub input_schema: ToolInputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<CallToolResultContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallToolResultContent {
    TextContent(TextContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub r#type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<JsonValue>,
}

impl TextContent {
    pub fn new(text: String) -> Self {
        Self {
            r#type: "text".to_string(),
            text,
            annotations: None,
        }
    }
}

/// A request from the client, decoded into its typed params.
#[derive(Debug)]
pub enum ClientRequest {
    InitializeRequest(<InitializeRequest as ModelContextProtocolRequest>::Params),
    PingRequest(<PingRequest as ModelContextProtocolRequest>::Params),
    ListToolsRequest(<ListToolsRequest as ModelContextProtocolRequest>::Params),
    CallToolRequest(<CallToolRequest as ModelContextProtocolRequest>::Params),
}

#[derive(Debug)]
pub enum ClientRequestParseError {
    UnknownMethod(String),
    InvalidParams {
        method: &'static str,
        error: serde_json::Error,
    },
}

impl std::fmt::Display for ClientRequestParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMethod(method) => write!(f, "unknown method: {method}"),
            Self::InvalidParams { method, error } => {
                write!(f, "invalid params for {method}: {error}")
            }
        }
    }
}

impl std::error::Error for ClientRequestParseError {}

fn parse_params<T: ModelContextProtocolRequest>(
    params: Option<JsonValue>,
) -> Result<T::Params, ClientRequestParseError> {
    serde_json::from_value::<T::Params>(params.unwrap_or(JsonValue::Null)).map_err(|error| {
        ClientRequestParseError::InvalidParams {
            method: T::METHOD,
            error,
        }
    })
}

impl TryFrom<JSONRPCRequest> for ClientRequest {
    type Error = ClientRequestParseError;

    fn try_from(request: JSONRPCRequest) -> Result<Self, Self::Error> {
        let JSONRPCRequest { method, params, .. } = request;
        match method.as_str() {
            InitializeRequest::METHOD => Ok(ClientRequest::InitializeRequest(parse_params::<
                InitializeRequest,
            >(params)?)),
            PingRequest::METHOD => Ok(ClientRequest::PingRequest(parse_params::<PingRequest>(
                params,
            )?)),
            ListToolsRequest::METHOD => Ok(ClientRequest::ListToolsRequest(parse_params::<
                ListToolsRequest,
            >(params)?)),
            CallToolRequest::METHOD => Ok(ClientRequest::CallToolRequest(parse_params::<
                CallToolRequest,
            >(params)?)),
            _ => Err(ClientRequestParseError::UnknownMethod(method)),
        }
    }
}
