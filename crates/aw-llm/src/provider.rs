use async_trait::async_trait;
use aw_error::{Error, Result};

use crate::types::{ChunkCallback, GenerateRequest, LLMResponse};

/// The seam every external provider SDK plugs into. Concrete wire formats
/// (OpenAI's REST schema, Anthropic's Messages API, Google's Gemini API)
/// are external collaborators here; this crate only commits
/// to the trait and the family-level dispatch selector below.
/// `OpenAiCompatibleClient` covers every OpenAI-compatible base URL in one
/// implementation rather than one per vendor.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<LLMResponse>;

    async fn generate_streaming(
        &self,
        request: GenerateRequest,
        on_chunk: ChunkCallback,
    ) -> Result<LLMResponse>;
}

/// Provider families: OpenAI-compatible (OpenAI, Azure, OpenAI-Compatible,
/// XAI, Ollama), Anthropic, Google. Unknown providers fail with
/// `UnsupportedProvider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAiCompatible,
    Anthropic,
    Google,
}

pub fn classify_provider(provider: &str) -> Result<ProviderFamily> {
    match provider.to_ascii_lowercase().as_str() {
        "openai" | "azure" | "openai-compatible" | "xai" | "ollama" => {
            Ok(ProviderFamily::OpenAiCompatible)
        }
        "anthropic" => Ok(ProviderFamily::Anthropic),
        "google" => Ok(ProviderFamily::Google),
        other => Err(Error::UnsupportedProvider(other.to_string())),
    }
}

/// Resolves a provider name to the client that speaks its family's wire
/// protocol. The queue (`aw_llm::queue`) calls this once per task rather
/// than holding long-lived client instances.
pub fn dispatch_client(provider: &str) -> Result<Box<dyn ProviderClient>> {
    match classify_provider(provider)? {
        ProviderFamily::OpenAiCompatible => Ok(Box::new(
            crate::openai_compatible::OpenAiCompatibleClient::default(),
        )),
        ProviderFamily::Anthropic => Ok(Box::new(crate::anthropic::AnthropicClient::default())),
        ProviderFamily::Google => Ok(Box::new(crate::google::GoogleClient::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_providers() {
        assert_eq!(
            classify_provider("ollama").unwrap(),
            ProviderFamily::OpenAiCompatible
        );
        assert_eq!(
            classify_provider("Anthropic").unwrap(),
            ProviderFamily::Anthropic
        );
        assert_eq!(classify_provider("google").unwrap(), ProviderFamily::Google);
    }

    #[test]
    fn unknown_provider_is_unsupported() {
        let err = classify_provider("mistral").unwrap_err();
        assert!(matches!(err, Error::UnsupportedProvider(_)));
    }
}
