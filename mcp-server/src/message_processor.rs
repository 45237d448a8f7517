use std::sync::Arc;

use filebroker_core::BrokerContext;
use filebroker_core::ops::Deadline;
use filebroker_core::ops::dispatch_tool;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;
use mcp_types::ClientRequest;
use mcp_types::INVALID_REQUEST_ERROR_CODE;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsResult;
use mcp_types::METHOD_NOT_FOUND_ERROR_CODE;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use mcp_types::ServerCapabilitiesTools;
use mcp_types::TextContent;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::task;

use crate::tool_config::all_tools;

/// Upper bound on concurrently executing tool calls; the broker's own
/// locks serialise per-file work, this just caps the worker fan-out.
const MAX_CONCURRENT_TOOL_CALLS: usize = 4;

pub(crate) struct MessageProcessor {
    context: Arc<BrokerContext>,
    outgoing: mpsc::Sender<JSONRPCMessage>,
    workers: Arc<Semaphore>,
    initialized: bool,
}

impl MessageProcessor {
    pub(crate) fn new(context: Arc<BrokerContext>, outgoing: mpsc::Sender<JSONRPCMessage>) -> Self {
        Self {
            context,
            outgoing,
            workers: Arc::new(Semaphore::new(MAX_CONCURRENT_TOOL_CALLS)),
            initialized: false,
        }
    }

    pub(crate) fn process_request(&mut self, request: JSONRPCRequest) {
        let request_id = request.id.clone();

        let client_request = match ClientRequest::try_from(request) {
            Ok(client_request) => client_request,
            Err(e) => {
                tracing::warn!("failed to convert request: {e}");
                self.send_error(request_id, METHOD_NOT_FOUND_ERROR_CODE, e.to_string());
                return;
            }
        };

        match client_request {
            ClientRequest::InitializeRequest(params) => {
                self.handle_initialize(request_id, params);
            }
            ClientRequest::PingRequest(params) => {
                self.handle_ping(request_id, params);
            }
            ClientRequest::ListToolsRequest(params) => {
                self.handle_list_tools(request_id, params);
            }
            ClientRequest::CallToolRequest(params) => {
                self.handle_call_tool(request_id, params);
            }
        }
    }

    pub(crate) fn process_response(&mut self, response: JSONRPCResponse) {
        tracing::info!("<- response: {:?}", response);
    }

    pub(crate) fn process_notification(&mut self, notification: JSONRPCNotification) {
        tracing::debug!("<- notification: {}", notification.method);
    }

    pub(crate) fn process_error(&mut self, err: JSONRPCError) {
        tracing::error!("<- error: {:?}", err);
    }

    fn handle_initialize(
        &mut self,
        id: RequestId,
        params: <mcp_types::InitializeRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::info!("initialize -> client: {:?}", params.client_info);

        if self.initialized {
            self.send_error(
                id,
                INVALID_REQUEST_ERROR_CODE,
                "initialize called more than once".to_string(),
            );
            return;
        }
        self.initialized = true;

        let result = mcp_types::InitializeResult {
            capabilities: mcp_types::ServerCapabilities {
                experimental: None,
                logging: None,
                prompts: None,
                resources: None,
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
            },
            instructions: Some(
                "Read lines to obtain access tokens; edits require a token covering the \
                 changed lines. All mutations are journaled and can be undone."
                    .to_string(),
            ),
            protocol_version: params.protocol_version.clone(),
            server_info: mcp_types::Implementation {
                name: "filebroker-mcp-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        self.send_response::<mcp_types::InitializeRequest>(id, result);
    }

    fn handle_ping(
        &self,
        id: RequestId,
        params: <mcp_types::PingRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::trace!("ping -> params: {:?}", params);
        self.send_response::<mcp_types::PingRequest>(id, json!({}));
    }

    fn handle_list_tools(
        &self,
        id: RequestId,
        params: <mcp_types::ListToolsRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::trace!("tools/list -> {params:?}");
        let result = ListToolsResult {
            tools: all_tools(),
            next_cursor: None,
        };
        self.send_response::<mcp_types::ListToolsRequest>(id, result);
    }

    fn handle_call_tool(&self, id: RequestId, params: CallToolRequestParams) {
        let CallToolRequestParams { name, arguments } = params;
        tracing::info!("tools/call -> {name}");

        let context = Arc::clone(&self.context);
        let workers = Arc::clone(&self.workers);
        let outgoing = self.outgoing.clone();

        // Tool calls run on blocking worker threads so the processor loop
        // stays responsive; the semaphore bounds the pool.
        task::spawn(async move {
            let _permit = workers.acquire_owned().await;
            let tool = name.clone();
            let outcome = task::spawn_blocking(move || {
                dispatch_tool(
                    &context,
                    &tool,
                    arguments.unwrap_or(json!({})),
                    &Deadline::none(),
                )
            })
            .await;

            let result = match outcome {
                Ok(Ok(output)) => CallToolResult {
                    content: vec![CallToolResultContent::TextContent(TextContent::new(
                        output.text,
                    ))],
                    is_error: None,
                },
                Ok(Err(e)) => CallToolResult {
                    content: vec![CallToolResultContent::TextContent(TextContent::new(
                        e.to_string(),
                    ))],
                    is_error: Some(true),
                },
                Err(e) => CallToolResult {
                    content: vec![CallToolResultContent::TextContent(TextContent::new(format!(
                        "tool worker for `{name}` panicked: {e}"
                    )))],
                    is_error: Some(true),
                },
            };

            let response = JSONRPCMessage::Response(JSONRPCResponse {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                result: serde_json::to_value(result).unwrap_or(json!({})),
            });
            if let Err(e) = outgoing.send(response).await {
                tracing::error!("failed to send tool result: {e}");
            }
        });
    }

    fn send_response<T>(&self, id: RequestId, result: T::Result)
    where
        T: ModelContextProtocolRequest,
    {
        let response = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: serde_json::to_value(result).unwrap_or(json!({})),
        });

        if let Err(e) = self.outgoing.try_send(response) {
            tracing::error!("failed to send response: {e}");
        }
    }

    fn send_error(&self, id: RequestId, code: i64, message: String) {
        let error_msg = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error: JSONRPCErrorError {
                code,
                message,
                data: None,
            },
        });
        if let Err(e) = self.outgoing.try_send(error_msg) {
            tracing::error!("failed to send error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use filebroker_core::Config;
    use filebroker_core::ConfigOverrides;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn processor_for(dir: &TempDir) -> (MessageProcessor, mpsc::Receiver<JSONRPCMessage>) {
        let config = Config::load_with_overrides(ConfigOverrides {
            roots: Some(vec![dir.path().to_path_buf()]),
            ..Default::default()
        })
        .unwrap();
        let (tx, rx) = mpsc::channel(8);
        (MessageProcessor::new(Arc::new(BrokerContext::new(config)), tx), rx)
    }

    fn request(id: i64, method: &str, params: serde_json::Value) -> JSONRPCRequest {
        JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Integer(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn initialize_twice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (mut processor, mut rx) = processor_for(&dir);
        let init_params = json!({
            "capabilities": {},
            "clientInfo": {"name": "test", "version": "0"},
            "protocolVersion": "2025-03-26",
        });

        processor.process_request(request(1, "initialize", init_params.clone()));
        assert!(matches!(rx.recv().await.unwrap(), JSONRPCMessage::Response(_)));

        processor.process_request(request(2, "initialize", init_params));
        match rx.recv().await.unwrap() {
            JSONRPCMessage::Error(e) => {
                assert_eq!(e.error.code, INVALID_REQUEST_ERROR_CODE);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tools_list_serves_the_registry() {
        let dir = TempDir::new().unwrap();
        let (mut processor, mut rx) = processor_for(&dir);
        processor.process_request(request(1, "tools/list", json!({})));
        match rx.recv().await.unwrap() {
            JSONRPCMessage::Response(r) => {
                let result: ListToolsResult = serde_json::from_value(r.result).unwrap();
                let names: Vec<&str> = result.tools.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, filebroker_core::ops::TOOL_NAMES.to_vec());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_tool_round_trips_and_reports_errors_in_band() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let (mut processor, mut rx) = processor_for(&dir);

        processor.process_request(request(
            1,
            "tools/call",
            json!({"name": "read_file", "arguments": {"path": "a.txt", "line": 1}}),
        ));
        match rx.recv().await.unwrap() {
            JSONRPCMessage::Response(r) => {
                let result: CallToolResult = serde_json::from_value(r.result).unwrap();
                assert_eq!(result.is_error, None);
                let CallToolResultContent::TextContent(text) = &result.content[0];
                assert!(text.text.contains("   1\thello"), "{}", text.text);
            }
            other => panic!("expected response, got {other:?}"),
        }

        processor.process_request(request(
            2,
            "tools/call",
            json!({"name": "read_file", "arguments": {"path": "missing.txt", "line": 1}}),
        ));
        match rx.recv().await.unwrap() {
            JSONRPCMessage::Response(r) => {
                let result: CallToolResult = serde_json::from_value(r.result).unwrap();
                assert_eq!(result.is_error, Some(true));
                let CallToolResultContent::TextContent(text) = &result.content[0];
                assert!(text.text.contains("does not exist"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_gets_a_json_rpc_error() {
        let dir = TempDir::new().unwrap();
        let (mut processor, mut rx) = processor_for(&dir);
        processor.process_request(request(1, "resources/list", json!({})));
        match rx.recv().await.unwrap() {
            JSONRPCMessage::Error(e) => {
                assert_eq!(e.error.code, METHOD_NOT_FOUND_ERROR_CODE);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
