//! Per-provider defaults for the OpenAI-compatible built-ins.
//!
//! Each built-in gets a profile with its base URL, default model, whether
//! it needs an API key and which optional features it serves. The profile
//! becomes the provider's registered default settings; user settings from
//! `ClientConfig::providers` are overlaid on top at construction time.

use llmux_types::config::ProviderSettings;
use llmux_types::llm::ProviderFeature;

/// Static description of one OpenAI-compatible built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAiCompatProfile {
    pub name: &'static str,
    pub base_url: &'static str,
    pub default_model: &'static str,
    /// Keyless servers (local runtimes) still work when no credential is set.
    pub requires_key: bool,
    pub features: &'static [ProviderFeature],
}

impl OpenAiCompatProfile {
    pub fn default_settings(&self) -> ProviderSettings {
        ProviderSettings {
            base_url: Some(self.base_url.to_string()),
            default_model: Some(self.default_model.to_string()),
            ..Default::default()
        }
    }
}

/// OpenAI. Base URL: `https://api.openai.com/v1`
pub const fn openai_profile() -> OpenAiCompatProfile {
    OpenAiCompatProfile {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
        requires_key: true,
        features: &[
            ProviderFeature::Streaming,
            ProviderFeature::Tools,
            ProviderFeature::Vision,
            ProviderFeature::JsonMode,
            ProviderFeature::Embeddings,
        ],
    }
}

/// Groq. Base URL: `https://api.groq.com/openai/v1`
pub const fn groq_profile() -> OpenAiCompatProfile {
    OpenAiCompatProfile {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.1-8b-instant",
        requires_key: true,
        features: &[
            ProviderFeature::Streaming,
            ProviderFeature::Tools,
            ProviderFeature::JsonMode,
        ],
    }
}

/// Mistral AI. Base URL: `https://api.mistral.ai/v1`
pub const fn mistral_profile() -> OpenAiCompatProfile {
    OpenAiCompatProfile {
        name: "mistral",
        base_url: "https://api.mistral.ai/v1",
        default_model: "mistral-small-latest",
        requires_key: true,
        features: &[
            ProviderFeature::Streaming,
            ProviderFeature::Tools,
            ProviderFeature::JsonMode,
            ProviderFeature::Embeddings,
        ],
    }
}

/// Together AI. Base URL: `https://api.together.xyz/v1`
pub const fn together_profile() -> OpenAiCompatProfile {
    OpenAiCompatProfile {
        name: "together",
        base_url: "https://api.together.xyz/v1",
        default_model: "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo",
        requires_key: true,
        features: &[
            ProviderFeature::Streaming,
            ProviderFeature::Tools,
            ProviderFeature::JsonMode,
            ProviderFeature::Embeddings,
        ],
    }
}

/// Ollama's OpenAI-compatible endpoint. Base URL: `http://localhost:11434/v1`
pub const fn ollama_profile() -> OpenAiCompatProfile {
    OpenAiCompatProfile {
        name: "ollama",
        base_url: "http://localhost:11434/v1",
        default_model: "llama3.1",
        requires_key: false,
        features: &[ProviderFeature::Streaming, ProviderFeature::Tools],
    }
}

/// Every profile registered by `register_builtin_providers`.
pub const BUILTIN_PROFILES: [OpenAiCompatProfile; 5] = [
    openai_profile(),
    groq_profile(),
    mistral_profile(),
    together_profile(),
    ollama_profile(),
];

/// Look up a built-in profile by registry name.
pub fn builtin_profile(name: &str) -> Option<OpenAiCompatProfile> {
    BUILTIN_PROFILES.iter().copied().find(|p| p.name == name)
}
