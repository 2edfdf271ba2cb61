use serde::Serialize;

use crate::message_id::MessageId;

/// One archived message as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailDocument {
    pub message_id: MessageId,
    /// Location of the source file, relative to the archive root.
    pub file_path: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    /// Message timestamp in seconds since the Unix epoch.
    pub date: Option<i64>,
    /// Logical mailbox the message was filed under.
    pub folder: String,
    pub size_bytes: u64,
    pub has_attachments: bool,
    /// Extracted body text, only present when content indexing is enabled.
    pub content: Option<String>,
    pub indexed_at_unix: i64,
    /// Modification time of the source file when it was extracted.
    pub file_mtime: u64,
}

impl EmailDocument {
    /// Text used to build a result snippet: the body when it was indexed,
    /// otherwise the subject line.
    pub fn snippet_source(&self) -> &str {
        match self.content.as_deref() {
            Some(content) if !content.trim().is_empty() => content,
            _ => &self.subject,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A minimal document for store and search tests.
    pub fn email(id: &str, subject: &str, from: &str) -> EmailDocument {
        EmailDocument {
            message_id: MessageId::parse(id).unwrap(),
            file_path: format!("{id}.eml"),
            subject: subject.to_string(),
            from: from.to_string(),
            to: "team@example.com".to_string(),
            cc: String::new(),
            date: None,
            folder: "INBOX".to_string(),
            size_bytes: 128,
            has_attachments: false,
            content: None,
            indexed_at_unix: 1_700_000_000,
            file_mtime: 1_700_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::email;

    #[test]
    fn snippet_source_prefers_content() {
        let mut doc = email("a@x", "Quarterly budget", "alice@example.com");
        assert_eq!(doc.snippet_source(), "Quarterly budget");

        doc.content = Some("Numbers attached.".to_string());
        assert_eq!(doc.snippet_source(), "Numbers attached.");

        doc.content = Some("   ".to_string());
        assert_eq!(doc.snippet_source(), "Quarterly budget");
    }
}
