// On-disk object store: one append-only file per cached remote object.
//
// All state is read from filesystem metadata on demand. File length is the
// download progress and modification time is the last access.

use std::fs;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

const CACHE_EXTENSION: &str = "cache";

/// Longest object id accepted; keeps encoded file names under common FS limits.
pub const MAX_ID_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub bytes_on_disk: u64,
    pub last_access: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) the cache directory.
    pub fn new(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_id(id), CACHE_EXTENSION))
    }

    /// Current size and last access of the object's file, `None` if absent.
    pub fn stat_object(&self, id: &str) -> CacheResult<Option<ObjectStat>> {
        match fs::metadata(self.path_for(id)) {
            Ok(meta) => Ok(Some(ObjectStat {
                bytes_on_disk: meta.len(),
                last_access: meta.modified()?,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes currently on disk for `id`, zero when the file is absent.
    pub fn bytes_on_disk(&self, id: &str) -> CacheResult<u64> {
        Ok(self.stat_object(id)?.map(|s| s.bytes_on_disk).unwrap_or(0))
    }

    /// Mark the object as just accessed. Content is untouched.
    pub fn touch(&self, id: &str) -> CacheResult<()> {
        filetime::set_file_mtime(self.path_for(id), FileTime::now())?;
        Ok(())
    }

    /// Open the object's file for reading, positioned at `start`.
    pub async fn open_for_read(&self, id: &str, start: u64) -> CacheResult<File> {
        let mut file = File::open(self.path_for(id)).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(file)
    }

    /// Fresh, truncated sink for a download starting at offset 0.
    pub async fn open_for_write(&self, id: &str) -> CacheResult<File> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_for(id))
            .await?;
        Ok(file)
    }

    /// Remove the object's file. An absent file is not an error.
    pub fn delete(&self, id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                debug!("cache file removed id={}", id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every cached object in the directory. Files that do not look like cache
    /// entries, or vanish mid-scan, are skipped.
    pub fn list_objects(&self) -> CacheResult<Vec<(String, ObjectStat)>> {
        let mut objects = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CACHE_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_id)
            else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            objects.push((
                id,
                ObjectStat {
                    bytes_on_disk: meta.len(),
                    last_access: meta.modified()?,
                },
            ));
        }
        Ok(objects)
    }
}

/// Reject ids that cannot name a cache file.
pub fn validate_id(id: &str) -> CacheResult<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(CacheError::InvalidId);
    }
    Ok(())
}

/// Keep `[A-Za-z0-9_-]` and non-leading `.`, percent-encode every other byte.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok().filter(|id| !id.is_empty())
}
