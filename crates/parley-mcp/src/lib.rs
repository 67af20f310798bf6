// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Remote-tool bridge: adapts an MCP-style tool server into
//! [`parley_tools::ToolClass`]es with per-tool parallelizability.

mod bridge;

pub use bridge::{
    info_from_mcp_tool, outcome_from_call_result, McpToolBridge, RemoteCallOutcome,
    RemoteToolInfo, ToolServer,
};
