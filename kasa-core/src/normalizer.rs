use unicode_normalization::UnicodeNormalization;

use crate::error::{CoreResult, KasaError};
use crate::model::{ChatMessage, NewApplication};

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

fn clean_optional(s: Option<String>) -> Option<String> {
    s.map(|v| clean_text(&v)).filter(|v| !v.is_empty())
}

/// Normalize an application before submission and enforce the required
/// fields. Business name and email must be non-empty after cleaning.
pub fn normalize_application(mut app: NewApplication) -> CoreResult<NewApplication> {
    app.business_name = clean_text(&app.business_name);
    app.email = clean_text(&app.email).to_lowercase();
    app.phone = clean_optional(app.phone);
    app.location = clean_optional(app.location);
    app.description = clean_optional(app.description);

    if app.business_name.is_empty() {
        return Err(KasaError::Validation("business name is required".into()));
    }
    if app.email.is_empty() {
        return Err(KasaError::Validation("email is required".into()));
    }
    Ok(app)
}

/// Normalize outbound chat messages; drops messages that are empty after
/// cleaning so the assistant never receives blank turns.
pub fn normalize_conversation(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .map(|mut m| {
            m.content = clean_text(&m.content);
            m
        })
        .filter(|m| !m.content.is_empty())
        .collect()
}
