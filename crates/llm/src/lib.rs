//! Streaming client for hosted text-generation services.
use std::sync::Arc;

mod error;
mod gemini;
mod provider;

pub use error::{ServiceError, ServiceErrorKind, redact_secrets};
pub use gemini::{DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, GeminiStreamClient};
pub use provider::{
    ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamClient, StreamEvent, StreamEventPayload,
    StreamRequest, StreamTarget, make_event_stream,
};

pub fn create_client(mut config: ProviderConfig) -> ProviderResult<Arc<dyn StreamClient>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" | "rig-gemini" => {
            config.provider_id = GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(GeminiStreamClient::new(config)))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-client",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_defaults_to_gemini() {
        let client = create_client(ProviderConfig::new("", "key", "")).expect("client");

        assert_eq!(client.id(), GEMINI_PROVIDER_ID);
        assert!(client.is_configured());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = create_client(ProviderConfig::new("openai", "key", ""));

        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { .. })
        ));
    }
}
