// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod proxy;
mod transport;

pub use proxy::{register_server_tools, McpProxyTool};
pub use transport::{McpClient, McpError, McpToolInfo, ServerState};
