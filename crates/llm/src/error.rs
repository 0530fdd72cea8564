use std::fmt;

/// Failure kinds every remote error is normalized into before it reaches the chat layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceErrorKind {
    /// Credentials are missing or rejected.
    Config,
    Network,
    Quota,
    /// The request was blocked by safety filtering.
    ContentPolicy,
    Timeout,
    /// Local guard: a request was built from an empty conversation.
    EmptyHistory,
    Unknown,
}

// Checked top to bottom, first match wins. Patterns are lowercase.
const CLASSIFICATION_RULES: &[(ServiceErrorKind, &[&str])] = &[
    (
        ServiceErrorKind::Config,
        &[
            "api key not valid",
            "api_key_invalid",
            "permission_denied",
            "unauthenticated",
        ],
    ),
    (
        ServiceErrorKind::Network,
        &[
            "fetch",
            "http status code: 0",
            "networkerror",
            "network",
            "connection",
            "error sending request",
            "dns",
        ],
    ),
    (
        ServiceErrorKind::Quota,
        &["quota", "resource_exhausted", "429", "rate limit"],
    ),
    (
        ServiceErrorKind::ContentPolicy,
        &["moderation", "blocked", "safety"],
    ),
    (
        ServiceErrorKind::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
];

const REDACTED: &str = "<redacted>";
const SECRET_QUERY_PARAM: &str = "key=";

impl ServiceErrorKind {
    /// Classifies raw upstream error text by substring.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        CLASSIFICATION_RULES
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|pattern| lowered.contains(pattern)))
            .map(|(kind, _)| *kind)
            .unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    /// Upstream text the kind was derived from.
    pub detail: String,
}

impl ServiceError {
    /// The detail is redacted: request URLs carry the API key as a query parameter.
    pub fn new(kind: ServiceErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: redact_secrets(&detail.into()),
        }
    }

    /// Builds a service error from raw upstream text.
    ///
    /// Services often wrap the useful message in a JSON envelope such as
    /// `{"error":{"message":"..."}}`, usually after a transport prefix like
    /// `Invalid status code 400 with message: `. The nested message wins when present;
    /// the full text is consulted only if the nested message matches no rule.
    pub fn classify(raw: &str) -> Self {
        let raw = redact_secrets(raw);
        let Some(nested) = extract_nested_message(&raw) else {
            let detail = raw.trim();
            return Self::new(ServiceErrorKind::classify(detail), detail);
        };

        let kind = match ServiceErrorKind::classify(&nested) {
            ServiceErrorKind::Unknown => ServiceErrorKind::classify(&raw),
            kind => kind,
        };
        Self::new(kind, nested)
    }

    /// Human-readable explanation shown on the failed assistant message.
    pub fn user_message(&self) -> String {
        match self.kind {
            ServiceErrorKind::Config => {
                "The API key is missing or invalid. Please check the configuration.".to_string()
            }
            ServiceErrorKind::Network => format!(
                "Network or connection error while contacting the AI. Check your internet connection. (Details: {})",
                self.detail
            ),
            ServiceErrorKind::Quota => {
                "The AI request quota has been exceeded. Please try again later.".to_string()
            }
            ServiceErrorKind::ContentPolicy => {
                "The request was blocked by the content safety rules.".to_string()
            }
            ServiceErrorKind::Timeout => {
                "The AI took too long to respond. Please try again later.".to_string()
            }
            ServiceErrorKind::EmptyHistory => {
                "The chat history is empty, there is nothing to send to the AI.".to_string()
            }
            ServiceErrorKind::Unknown => {
                format!("AI error: {}. Please try again later.", self.detail)
            }
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:?} service error: {}", self.kind, self.detail)
    }
}

impl std::error::Error for ServiceError {}

/// Replaces the value of every `key=` query parameter.
pub fn redact_secrets(text: &str) -> String {
    let mut redacted = String::with_capacity(text.len());
    let mut rest = text;

    // ASCII lowercasing keeps byte offsets intact.
    while let Some(index) = rest.to_ascii_lowercase().find(SECRET_QUERY_PARAM) {
        let value_start = index + SECRET_QUERY_PARAM.len();
        redacted.push_str(&rest[..value_start]);

        let value = &rest[value_start..];
        let value_len = value
            .find(|ch: char| {
                matches!(ch, '&' | '#' | ')' | '"' | '\'' | ',') || ch.is_whitespace()
            })
            .unwrap_or(value.len());
        if value_len > 0 {
            redacted.push_str(REDACTED);
        }
        rest = &value[value_len..];
    }

    redacted.push_str(rest);
    redacted
}

fn extract_nested_message(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }

    let value = serde_json::from_str::<serde_json::Value>(&raw[start..=end]).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_text_classifies_as_quota() {
        let error = ServiceError::classify("Request failed: Quota exceeded for project");

        assert_eq!(error.kind, ServiceErrorKind::Quota);
        assert!(error.user_message().contains("quota"));
    }

    #[test]
    fn earlier_rule_wins_when_several_match() {
        // "network" precedes "timeout" in the rule order.
        assert_eq!(
            ServiceErrorKind::classify("network timeout while reading body"),
            ServiceErrorKind::Network
        );
        assert_eq!(
            ServiceErrorKind::classify("API key not valid, request blocked"),
            ServiceErrorKind::Config
        );
    }

    #[test]
    fn each_kind_has_a_matching_phrase() {
        let cases = [
            ("API_KEY_INVALID", ServiceErrorKind::Config),
            ("NetworkError when attempting to fetch resource", ServiceErrorKind::Network),
            ("status 429 RESOURCE_EXHAUSTED", ServiceErrorKind::Quota),
            ("Response was blocked due to SAFETY", ServiceErrorKind::ContentPolicy),
            ("operation timed out", ServiceErrorKind::Timeout),
            ("something odd happened", ServiceErrorKind::Unknown),
        ];

        for (text, expected) in cases {
            assert_eq!(ServiceErrorKind::classify(text), expected, "{text}");
        }
    }

    #[test]
    fn nested_json_message_is_classified() {
        let raw = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key."}}"#;
        let error = ServiceError::classify(raw);

        assert_eq!(error.kind, ServiceErrorKind::Config);
        assert_eq!(error.detail, "API key not valid. Please pass a valid API key.");
    }

    #[test]
    fn top_level_json_message_is_used() {
        let error = ServiceError::classify(r#"{"message":"deadline exceeded"}"#);

        assert_eq!(error.kind, ServiceErrorKind::Timeout);
    }

    #[test]
    fn malformed_json_falls_back_to_raw_text() {
        let error = ServiceError::classify("{not json but mentions quota}");

        assert_eq!(error.kind, ServiceErrorKind::Quota);
        assert_eq!(error.detail, "{not json but mentions quota}");
    }

    #[test]
    fn envelope_after_transport_prefix_is_unwrapped() {
        let raw = "ProviderError: Invalid status code 400 Bad Request with message: \
            {\"error\":{\"code\":400,\"message\":\"models/foo is not found for API version v1beta\"}}";
        let error = ServiceError::classify(raw);

        assert_eq!(error.kind, ServiceErrorKind::Unknown);
        assert_eq!(error.detail, "models/foo is not found for API version v1beta");
        assert!(!error.user_message().contains('{'));
    }

    #[test]
    fn status_prefix_classifies_when_nested_message_is_vague() {
        let raw = r#"Invalid status code 429 Too Many Requests with message: {"error":{"message":"Try later."}}"#;
        let error = ServiceError::classify(raw);

        assert_eq!(error.kind, ServiceErrorKind::Quota);
        assert_eq!(error.detail, "Try later.");
    }

    #[test]
    fn api_key_in_request_url_is_redacted() {
        let raw = "ProviderError: Http client error: error sending request for url \
            (http://127.0.0.1:1/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse&key=AIza-secret)";
        let error = ServiceError::classify(raw);

        assert_eq!(error.kind, ServiceErrorKind::Network);
        assert!(!error.detail.contains("AIza-secret"));
        assert!(!error.user_message().contains("AIza-secret"));
        assert!(!error.to_string().contains("AIza-secret"));
        assert!(error.detail.contains("alt=sse&key=<redacted>)"));
    }

    #[test]
    fn redaction_handles_every_key_parameter() {
        assert_eq!(
            redact_secrets("a?key=one&b=2 and API_KEY=two"),
            "a?key=<redacted>&b=2 and API_KEY=<redacted>"
        );
        assert_eq!(redact_secrets("empty key= value"), "empty key= value");
        assert_eq!(redact_secrets("API key not valid"), "API key not valid");
    }

    #[test]
    fn unknown_error_keeps_upstream_detail() {
        let error = ServiceError::classify("upstream exploded");

        assert_eq!(error.kind, ServiceErrorKind::Unknown);
        assert!(error.user_message().contains("upstream exploded"));
    }
}
