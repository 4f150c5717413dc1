// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bridges MCP server tools into the shared [`ToolRegistry`].
//!
//! Each tool a server advertises registers as a [`McpProxyTool`] named
//! `mcp_<server>_<tool>`, which keeps external names from colliding with
//! builtins and makes MCP transparent to the dispatcher and the agent loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use otto_tools::{RiskLevel, Tool, ToolCall, ToolOutput, ToolRegistry};

use crate::transport::{McpClient, ServerState};

pub struct McpProxyTool {
    client: Arc<McpClient>,
    /// Registry-facing name, `mcp_<server>_<tool>`.
    name: String,
    /// The tool's name on the server side.
    remote_name: String,
    description: String,
    schema: Value,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    /// External tools never qualify for the read-only auto-approval tier;
    /// their risk cannot be inferred from the schema.
    fn risk(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.call_tool(&self.remote_name, call.args.clone()).await {
            Ok((text, false)) => ToolOutput::ok(&call.id, text),
            Ok((text, true)) => ToolOutput::err(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, format!("mcp call failed: {e}")),
        }
    }
}

/// Enumerate a ready server's tools and register each as a proxy.
/// Returns how many tools were added.  A server that is not `Ready` (died
/// during or after initialize) registers nothing.
pub async fn register_server_tools(
    registry: &mut ToolRegistry,
    client: Arc<McpClient>,
) -> anyhow::Result<usize> {
    if client.state() != ServerState::Ready {
        warn!(server = %client.name(), state = %client.state(), "skipping tool registration");
        return Ok(0);
    }
    let tools = client.list_tools().await?;
    let count = tools.len();
    for info in tools {
        let name = format!("mcp_{}_{}", client.name(), info.name);
        debug!(tool = %name, "registering mcp proxy tool");
        registry.register(McpProxyTool {
            client: Arc::clone(&client),
            name,
            remote_name: info.name,
            description: info.description,
            schema: info.input_schema,
        });
    }
    Ok(count)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
