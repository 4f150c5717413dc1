// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod mock;
mod openai_compat;
mod provider;
mod types;
pub mod wire;

pub use openai_compat::OpenAICompatProvider;
pub use provider::{ModelInfo, ModelProvider, ResponseStream};
pub use types::*;

use std::sync::Arc;

use otto_config::ModelConfig;

/// Build a provider from configuration.
///
/// Every supported endpoint speaks the OpenAI-compatible `/chat/completions`
/// SSE wire format, so this currently always returns an
/// [`OpenAICompatProvider`]; the indirection keeps call sites stable if other
/// wire formats are added.
pub fn from_config(cfg: &ModelConfig) -> Arc<dyn ModelProvider> {
    Arc::new(OpenAICompatProvider::from_config(cfg))
}
