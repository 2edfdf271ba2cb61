use std::{collections::HashMap, path::Path};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    backends::InMemoryBackend,
};

use crate::{
    error::{Error, Result},
    message_id::MessageId,
    walker::ArchiveFile,
};

/// Archive-relative path to the serialized [`FileState`].
const FILE_STATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("file_states");

/// What the indexer last saw of an archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub message_id: MessageId,
    pub mtime: u64,
    pub mtime_nanos: u32,
    pub size_bytes: u64,
    /// Whether the document was extracted with its body.
    pub with_content: bool,
}

impl FileState {
    pub fn of(file: &ArchiveFile, message_id: MessageId, with_content: bool) -> Self {
        Self {
            message_id,
            mtime: file.mtime,
            mtime_nanos: file.mtime_nanos,
            size_bytes: file.size_bytes,
            with_content,
        }
    }

    /// Whether `file` is the same revision this state was recorded from,
    /// extracted the same way.
    pub fn matches(&self, file: &ArchiveFile, with_content: bool) -> bool {
        self.mtime == file.mtime
            && self.mtime_nanos == file.mtime_nanos
            && self.size_bytes == file.size_bytes
            && self.with_content == with_content
    }

    /// Serialize as `message_id\0mtime\0nanos\0size\0content`.
    pub fn serialize(&self) -> Vec<u8> {
        format!(
            "{}\0{}\0{}\0{}\0{}",
            self.message_id.as_str(),
            self.mtime,
            self.mtime_nanos,
            self.size_bytes,
            u8::from(self.with_content)
        )
        .into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(bytes).ok()?;
        let mut parts = s.splitn(5, '\0');
        let message_id = MessageId::parse(parts.next()?)?;
        let mtime = parts.next()?.parse().ok()?;
        let mtime_nanos = parts.next()?.parse().ok()?;
        let size_bytes = parts.next()?.parse().ok()?;
        let with_content = match parts.next()? {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        Some(Self {
            message_id,
            mtime,
            mtime_nanos,
            size_bytes,
            with_content,
        })
    }
}

/// A change applied to the table after a document commit.
#[derive(Debug, Clone)]
pub enum FileStateChange {
    Record(String, FileState),
    Forget(String),
}

/// Per-file change-detection table, keyed by archive-relative path.
pub struct FileStateDb {
    db: Database,
}

impl FileStateDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => Error::Storage(format!(
                "{} is in use by another process",
                path.display()
            )),
            other => Error::RedbDatabase(other),
        })?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write()?;
        txn.open_table(FILE_STATES)?;
        txn.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, path: &str) -> Result<Option<FileState>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_STATES)?;
        Ok(table
            .get(path)?
            .and_then(|v| FileState::deserialize(v.value())))
    }

    /// Load the whole table. Unreadable entries are left out, so the files
    /// they describe are extracted again.
    pub fn list(&self) -> Result<HashMap<String, FileState>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_STATES)?;
        let mut states = HashMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if let Some(state) = FileState::deserialize(v.value()) {
                states.insert(k.value().to_string(), state);
            }
        }
        Ok(states)
    }

    /// Apply `changes` in one transaction, after emptying the table when
    /// `clear` is set.
    pub fn apply(&self, clear: bool, changes: &[FileStateChange]) -> Result<()> {
        let txn = self.db.begin_write()?;
        if clear {
            txn.delete_table(FILE_STATES)?;
        }
        {
            let mut table = txn.open_table(FILE_STATES)?;
            for change in changes {
                match change {
                    FileStateChange::Record(path, state) => {
                        table.insert(path.as_str(), state.serialize().as_slice())?;
                    }
                    FileStateChange::Forget(path) => {
                        table.remove(path.as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_STATES)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for FileStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateDb").finish_non_exhaustive()
    }
}
