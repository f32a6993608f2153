//! Server error codes and the text shown for them.

use tracing::warn;

use ragchat_client::ErrorPayload;

/// Used when the server reports an error with neither a known code nor a message.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong while generating the answer.";

/// Fixed code table. Codes outside it fall back to the server's own message.
pub fn message_for_code(code: &str) -> Option<&'static str> {
    match code {
        "RATE_LIMIT_EXCEEDED" => {
            Some("Too many requests. Please wait a moment and try again.")
        }
        "GLOBAL_RATE_LIMIT_EXCEEDED" => {
            Some("The service is handling too many requests right now. Please try again in a minute.")
        }
        "QUOTA_EXCEEDED" => Some("The language model quota is used up. Please try again later."),
        "LLM_ERROR" => Some("The answer could not be generated. Please try again."),
        "INTERNAL_ERROR" => Some("The server ran into an internal error."),
        _ => None,
    }
}

/// Text to show for a server-reported `error` event.
pub fn user_facing(err: &ErrorPayload) -> String {
    if let Some(code) = err.code.as_deref() {
        if let Some(text) = message_for_code(code) {
            return text.to_string();
        }
        warn!(code, message = %err.message, "Unrecognized error code from server");
    }

    if err.message.trim().is_empty() {
        GENERIC_ERROR_MESSAGE.to_string()
    } else {
        err.message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(message: &str, code: Option<&str>) -> ErrorPayload {
        ErrorPayload {
            message: message.into(),
            code: code.map(Into::into),
        }
    }

    #[test]
    fn test_known_code_wins_over_message() {
        let text = user_facing(&payload("raw server text", Some("RATE_LIMIT_EXCEEDED")));
        assert_eq!(text, message_for_code("RATE_LIMIT_EXCEEDED").unwrap());
    }

    #[test]
    fn test_unknown_code_falls_back_to_message() {
        assert_eq!(user_facing(&payload("Server error", Some("500"))), "Server error");
    }

    #[test]
    fn test_missing_code_uses_message() {
        assert_eq!(user_facing(&payload("not ready", None)), "not ready");
    }

    #[test]
    fn test_empty_message_gets_generic_text() {
        assert_eq!(user_facing(&payload("  ", None)), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn test_table_covers_rate_quota_and_server_errors() {
        for code in [
            "RATE_LIMIT_EXCEEDED",
            "GLOBAL_RATE_LIMIT_EXCEEDED",
            "QUOTA_EXCEEDED",
            "LLM_ERROR",
            "INTERNAL_ERROR",
        ] {
            assert!(message_for_code(code).is_some(), "{code} missing");
        }
        assert!(message_for_code("rate_limit_exceeded").is_none());
    }
}
