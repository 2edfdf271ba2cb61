use std::path::{Path, PathBuf};

use mail_parser::{Addr, Address, MessageParser};

use crate::{document::EmailDocument, message_id::MessageId, walker::ArchiveFile};

/// Folder assigned to messages stored at the top of the archive.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Maildir delivery subdirectories, which are not part of the folder name.
const MAILDIR_LEAVES: &[&str] = &["cur", "new", "tmp"];

/// Why a single file could not be turned into a document.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Turns an archive file into an [`EmailDocument`].
///
/// Implementations are called from several threads at once.
pub trait MetadataExtractor: Send + Sync {
    fn extract(
        &self,
        file: &ArchiveFile,
        include_content: bool,
    ) -> Result<EmailDocument, ExtractError>;
}

/// RFC 5322 extractor backed by `mail-parser`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MailParserExtractor;

impl MetadataExtractor for MailParserExtractor {
    fn extract(
        &self,
        file: &ArchiveFile,
        include_content: bool,
    ) -> Result<EmailDocument, ExtractError> {
        let raw = std::fs::read(&file.absolute_path).map_err(|source| {
            ExtractError::Io {
                path: file.relative_path.clone(),
                source,
            }
        })?;
        parse_message(&raw, file, include_content)
    }
}

/// Parse raw message bytes read from `file`.
///
/// A message without a `Message-ID` gets a synthetic id derived from its
/// bytes, as long as it has at least one of `From`, `Subject` or `Date`.
pub fn parse_message(
    raw: &[u8],
    file: &ArchiveFile,
    include_content: bool,
) -> Result<EmailDocument, ExtractError> {
    let parse_error = |reason: &str| ExtractError::Parse {
        path: file.relative_path.clone(),
        reason: reason.to_string(),
    };

    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(parse_error("empty message"));
    }
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| parse_error("not an RFC 5322 message"))?;

    let message_id = message.message_id().and_then(MessageId::parse);
    let subject = message.subject().unwrap_or_default().trim().to_string();
    let from = format_addresses(message.from());
    let date = message.date().map(|d| d.to_timestamp());

    if message_id.is_none() && subject.is_empty() && from.is_empty() && date.is_none()
    {
        return Err(parse_error("no message headers found"));
    }

    let content = if include_content {
        message.body_text(0).map(|body| body.into_owned())
    } else {
        None
    };

    Ok(EmailDocument {
        message_id: message_id.unwrap_or_else(|| MessageId::synthetic(raw)),
        file_path: file.key(),
        subject,
        from,
        to: format_addresses(message.to()),
        cc: format_addresses(message.cc()),
        date,
        folder: folder_for(&file.relative_path),
        size_bytes: raw.len() as u64,
        has_attachments: message.attachment_count() > 0,
        content,
        indexed_at_unix: 0,
        file_mtime: file.mtime,
    })
}

/// Render an address header as `Name <addr>` entries joined by `, `.
fn format_addresses(address: Option<&Address<'_>>) -> String {
    let Some(address) = address else {
        return String::new();
    };
    let addrs: Vec<&Addr<'_>> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => {
            groups.iter().flat_map(|g| g.addresses.iter()).collect()
        }
    };
    addrs
        .into_iter()
        .filter_map(|addr| {
            let name = addr.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
            let email = addr.address.as_deref().map(str::trim).filter(|e| !e.is_empty());
            match (name, email) {
                (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
                (None, Some(email)) => Some(email.to_string()),
                (Some(name), None) => Some(name.to_string()),
                (None, None) => None,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Logical folder of a message, from its directory inside the archive.
///
/// Maildir delivery directories are dropped and the leading dot of
/// Maildir++ folder names is removed.
pub fn folder_for(relative_path: &Path) -> String {
    let mut parts: Vec<String> = relative_path
        .parent()
        .into_iter()
        .flat_map(Path::components)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts
        .last()
        .is_some_and(|leaf| MAILDIR_LEAVES.contains(&leaf.as_str()))
    {
        parts.pop();
    }
    let parts: Vec<&str> = parts
        .iter()
        .map(|p| p.strip_prefix('.').unwrap_or(p))
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        DEFAULT_FOLDER.to_string()
    } else {
        parts.join("/")
    }
}
