/// How a data file's pages are compressed before transfer, independent of
/// whatever compression the tablespace itself already used on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    None,
    Zlib,
    Lz4,
    Zstd,
}

/// Per-tablespace encryption metadata carried alongside file metadata.
/// `key_version`/`wrapped_key` describe the *destination*-side re-wrap of the
/// tablespace key performed during `PageCopy` of page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    pub encrypted: bool,
    pub key_version: u32,
    /// AES key wrapped under the destination master key; empty when
    /// `encrypted` is false.
    pub wrapped_key: Vec<u8>,
    pub wrapped_iv: Vec<u8>,
}

impl EncryptionMetadata {
    pub fn none() -> Self {
        EncryptionMetadata {
            encrypted: false,
            key_version: 0,
            wrapped_key: Vec::new(),
            wrapped_iv: Vec::new(),
        }
    }
}

/// Name-extension tag a destination file can carry while clone or a
/// concurrent DDL is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameExtension {
    /// No extension: the file is in its final, stable location.
    None,
    /// `.ibu.clone-replace`: this file must be overwritten during recovery.
    Replace,
    /// `.ibd.clone-ddl`: a rename is in flight; reconciled by the
    /// destination on recovery.
    Ddl,
}

impl NameExtension {
    pub fn suffix(&self) -> &'static str {
        match self {
            NameExtension::None => "",
            NameExtension::Replace => ".ibu.clone-replace",
            NameExtension::Ddl => ".ibd.clone-ddl",
        }
    }
}

/// Immutable, file-index-addressed description of one data file inside a
/// snapshot state. `begin_chunk..=end_chunk` partitions the state's global
/// chunk range; file indices are dense and stable for the state's duration
///.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_size: u64,
    pub space_id: u32,
    pub file_index: u32,
    pub begin_chunk: u32,
    pub end_chunk: u32,
    pub name: String,
    pub fsp_flags: u32,
    pub encryption: EncryptionMetadata,
    pub compress_type: CompressType,
    pub punch_hole: bool,
    pub fsblk_size: u32,
    pub deleted: bool,
    pub renamed: bool,
}

impl FileMetadata {
    pub fn chunk_count(&self) -> u32 {
        self.end_chunk - self.begin_chunk + 1
    }

    pub fn contains_chunk(&self, chunk_num: u32) -> bool {
        chunk_num >= self.begin_chunk && chunk_num <= self.end_chunk
    }
}
