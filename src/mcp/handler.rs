// src/mcp/handler.rs
// MCP ServerHandler implementation - protocol lifecycle and resources

use rmcp::{
    ErrorData, ServerHandler,
    model::{
        AnnotateAble, Annotated, CallToolRequestParams, CallToolResult, ListResourcesResult,
        ListToolsResult, PaginatedRequestParams, RawResource, ReadResourceRequestParams,
        ReadResourceResult, ResourceContents, ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
};

use super::MemoryServer;

fn no_ann<T: AnnotateAble>(raw: T) -> Annotated<T> {
    Annotated::new(raw, None)
}

impl MemoryServer {
    fn resource_list() -> Vec<Annotated<RawResource>> {
        vec![
            no_ann(RawResource {
                uri: "memory://status".into(),
                name: "status".into(),
                title: Some("Service Status".into()),
                description: Some("Component metrics, pool usage and cost report".into()),
                mime_type: Some("application/json".into()),
                size: None,
                icons: None,
                meta: None,
            }),
            no_ann(RawResource {
                uri: "memory://health".into(),
                name: "health".into(),
                title: Some("Service Health".into()),
                description: Some("Per-component health summary".into()),
                mime_type: Some("application/json".into()),
                size: None,
                icons: None,
                meta: None,
            }),
        ]
    }
}

impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: rmcp::model::Implementation {
                name: "claude-memory".into(),
                title: Some("Claude Memory - conversational memory service".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Distills conversations into searchable memory units and injects relevant \
                 context back into prompts. Use claude_memory_search to recall, \
                 claude_memory_inject to enrich a prompt."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            let context =
                rmcp::handler::server::tool::ToolCallContext::new(self, request, context);
            self.tool_router.call(context).await
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, ErrorData>> + Send + '_ {
        async move {
            Ok(ListResourcesResult {
                resources: Self::resource_list(),
                next_cursor: None,
                meta: None,
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, ErrorData>> + Send + '_ {
        async move {
            let payload = match request.uri.as_str() {
                "memory://status" => self.core.status().await,
                "memory://health" => self.core.health(true).await,
                other => {
                    return Err(ErrorData::invalid_params(
                        format!("Unknown resource URI: {other}"),
                        None,
                    ));
                }
            };
            let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".into());
            Ok(ReadResourceResult {
                contents: vec![ResourceContents::TextResourceContents {
                    uri: request.uri,
                    mime_type: Some("application/json".into()),
                    text,
                    meta: None,
                }],
            })
        }
    }
}
