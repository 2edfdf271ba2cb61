use serde::Serialize;

/// Domain used for identifiers synthesized from message bytes.
const SYNTHETIC_DOMAIN: &str = "maildex.invalid";

/// A normalized `Message-ID`, the primary key of the document store.
///
/// Header values are trimmed and stripped of one pair of enclosing angle
/// brackets, so `<abc@host>` and `abc@host` name the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Normalize a raw header value. Returns `None` when nothing is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed)
            .trim();
        if inner.is_empty() {
            None
        } else {
            Some(Self(inner.to_string()))
        }
    }

    /// Derive a stable identifier from the raw message bytes, for messages
    /// that carry no `Message-ID` header.
    pub fn synthetic(raw_message: &[u8]) -> Self {
        let hash = blake3::hash(raw_message);
        let hex = hash.to_hex();
        Self(format!("{}@{SYNTHETIC_DOMAIN}", &hex[..32]))
    }

    /// Wrap a value already known to be normalized (e.g. read back from the
    /// index).
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.ends_with(SYNTHETIC_DOMAIN)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_angle_brackets() {
        let id = MessageId::parse("  <abc@example.com> ").unwrap();
        assert_eq!(id.as_str(), "abc@example.com");
    }

    #[test]
    fn bare_and_bracketed_are_equal() {
        assert_eq!(
            MessageId::parse("<abc@example.com>"),
            MessageId::parse("abc@example.com")
        );
    }

    #[test]
    fn empty_is_rejected() {
        assert!(MessageId::parse("").is_none());
        assert!(MessageId::parse("  <> ").is_none());
    }

    #[test]
    fn synthetic_is_deterministic() {
        let a = MessageId::synthetic(b"Subject: hi\r\n\r\nbody");
        let b = MessageId::synthetic(b"Subject: hi\r\n\r\nbody");
        assert_eq!(a, b);
        assert!(a.is_synthetic());
    }

    #[test]
    fn synthetic_differs_by_content() {
        let a = MessageId::synthetic(b"one");
        let b = MessageId::synthetic(b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn display_has_brackets() {
        let id = MessageId::parse("abc@example.com").unwrap();
        assert_eq!(id.to_string(), "<abc@example.com>");
    }
}
