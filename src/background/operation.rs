//! Background operation payloads and their durable record encoding.
//!
//! Every filesystem notification the virtualization driver reports becomes a
//! `BackgroundOperation`: a kind, the virtual path it concerns, and for
//! renames the path it came from. Operations are identified by a 128-bit id
//! whose 16 raw bytes key the durable store.
//!
//! # Record layout (version 1)
//! ```text
//! u8  version
//! u8  kind tag
//! u16 LE  path length, then that many UTF-8 bytes
//! u16 LE  secondary path length (0 when absent), then bytes
//! ```
//! Decoding rejects unknown versions and tags, truncated buffers, and
//! trailing garbage. Tags are stable; append new kinds, never renumber.

use std::fmt;

use uuid::Uuid;

use super::store::StoreError;

/// Current durable record version.
const RECORD_VERSION: u8 = 1;

/// Longest path accepted in a record (u16 length prefix).
const MAX_PATH_LEN: usize = u16::MAX as usize;

/// Unique identifier of a background operation.
///
/// The raw bytes are the durable-store key; `Display` renders the
/// hyphenated lowercase UUID form for logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the 16 raw bytes used as the store key.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Reconstructs an id from store-key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filesystem notification kinds reported by the virtualization driver.
///
/// Tags in comments are the stable on-disk discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationKind {
    /// A new file appeared in the virtual tree. (1)
    FileCreated,
    /// A file was deleted. (2)
    FileDeleted,
    /// A file's contents were replaced wholesale. (3)
    FileOverwritten,
    /// A placeholder was superseded or deleted out from under us. (4)
    FileSupersededOrDeleted,
    /// A placeholder was hydrated into a full file. (5)
    FileConvertedToFull,
    /// A file moved; the record's secondary path is the source. (6)
    FileRenamed,
    /// A new directory appeared. (7)
    FolderCreated,
    /// A directory was deleted. (8)
    FolderDeleted,
    /// A directory moved; the secondary path is the source. (9)
    FolderRenamed,
    /// A placeholder delete failed and needs index reconciliation. (10)
    FailedPlaceholderDelete,
}

impl OperationKind {
    fn tag(self) -> u8 {
        match self {
            Self::FileCreated => 1,
            Self::FileDeleted => 2,
            Self::FileOverwritten => 3,
            Self::FileSupersededOrDeleted => 4,
            Self::FileConvertedToFull => 5,
            Self::FileRenamed => 6,
            Self::FolderCreated => 7,
            Self::FolderDeleted => 8,
            Self::FolderRenamed => 9,
            Self::FailedPlaceholderDelete => 10,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::FileCreated,
            2 => Self::FileDeleted,
            3 => Self::FileOverwritten,
            4 => Self::FileSupersededOrDeleted,
            5 => Self::FileConvertedToFull,
            6 => Self::FileRenamed,
            7 => Self::FolderCreated,
            8 => Self::FolderDeleted,
            9 => Self::FolderRenamed,
            10 => Self::FailedPlaceholderDelete,
            _ => return None,
        })
    }

    /// Returns true when records of this kind carry a secondary path.
    #[must_use]
    pub fn has_secondary_path(self) -> bool {
        matches!(self, Self::FileRenamed | Self::FolderRenamed)
    }
}

/// One unit of work for the background queue.
///
/// Created by the virtualization boundary at enqueue time, persisted before
/// acknowledgement, removed only after its callback succeeds, and never
/// mutated in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackgroundOperation {
    id: OperationId,
    kind: OperationKind,
    virtual_path: String,
    old_virtual_path: Option<String>,
}

impl BackgroundOperation {
    /// Creates an operation with a fresh id.
    #[must_use]
    pub fn new(kind: OperationKind, virtual_path: impl Into<String>) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            virtual_path: virtual_path.into(),
            old_virtual_path: None,
        }
    }

    /// Creates a rename operation carrying the source path.
    #[must_use]
    pub fn renamed(
        kind: OperationKind,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        debug_assert!(kind.has_secondary_path(), "kind does not carry a source path");
        Self {
            id: OperationId::generate(),
            kind,
            virtual_path: to.into(),
            old_virtual_path: Some(from.into()),
        }
    }

    /// The operation's unique id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The notification kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The virtual path the operation concerns.
    #[must_use]
    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    /// For renames, the path the entry moved from.
    #[must_use]
    pub fn old_virtual_path(&self) -> Option<&str> {
        self.old_virtual_path.as_deref()
    }

    /// Serializes the payload into the version-1 record layout.
    ///
    /// The id is not part of the value; it is the store key.
    ///
    /// # Errors
    /// Returns `StoreError::RecordTooLarge` when a path exceeds the u16
    /// length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let path = self.virtual_path.as_bytes();
        let secondary = self
            .old_virtual_path
            .as_deref()
            .map(str::as_bytes)
            .unwrap_or(&[]);
        if path.len() > MAX_PATH_LEN || secondary.len() > MAX_PATH_LEN {
            return Err(StoreError::RecordTooLarge {
                len: path.len().max(secondary.len()),
                max: MAX_PATH_LEN,
            });
        }

        let mut buf = Vec::with_capacity(2 + 2 + path.len() + 2 + secondary.len());
        buf.push(RECORD_VERSION);
        buf.push(self.kind.tag());
        buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&(secondary.len() as u16).to_le_bytes());
        buf.extend_from_slice(secondary);
        Ok(buf)
    }

    /// Reconstructs an operation from a store key and record value.
    ///
    /// # Errors
    /// Returns `StoreError::CorruptRecord` for unknown versions or tags,
    /// truncated buffers, non-UTF-8 paths, or trailing bytes.
    pub fn decode(id: OperationId, value: &[u8]) -> Result<Self, StoreError> {
        let mut cursor = Cursor { buf: value, pos: 0 };

        let version = cursor.take_u8()?;
        if version != RECORD_VERSION {
            return Err(StoreError::corrupt("unsupported record version"));
        }
        let kind = OperationKind::from_tag(cursor.take_u8()?)
            .ok_or_else(|| StoreError::corrupt("unknown operation kind tag"))?;
        let virtual_path = cursor.take_string()?;
        let secondary = cursor.take_string()?;
        if cursor.pos != value.len() {
            return Err(StoreError::corrupt("trailing bytes in record"));
        }

        Ok(Self {
            id,
            kind,
            virtual_path,
            old_virtual_path: if secondary.is_empty() {
                None
            } else {
                Some(secondary)
            },
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take_u8(&mut self) -> Result<u8, StoreError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| StoreError::corrupt("truncated record"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_string(&mut self) -> Result<String, StoreError> {
        let lo = self.take_u8()?;
        let hi = self.take_u8()?;
        let len = u16::from_le_bytes([lo, hi]) as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| StoreError::corrupt("truncated record"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::corrupt("record path is not UTF-8"))
    }
}
