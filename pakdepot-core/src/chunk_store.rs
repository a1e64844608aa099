//! Chunk-addressed view over cached artifacts.
//!
//! Peers exchange packages as fixed-size chunks. Rather than keeping a
//! second copy of every payload, the store indexes byte ranges of artifacts
//! already sitting in the cache and serves chunk reads straight from those
//! files, verifying each chunk's sha256 on the way out.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{DepotError, DepotResult};

/// One addressable slice of an artifact.
#[derive(Debug, Clone)]
struct ChunkMeta {
    id: String,
    offset: u64,
    len: u64,
    sha256: String,
    path: PathBuf,
}

#[derive(Debug)]
pub struct ChunkStore {
    chunk_size: u64,
    /// share key (`manager:name`) -> ordered chunk metadata
    packages: RwLock<HashMap<String, Vec<ChunkMeta>>>,
}

impl ChunkStore {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            packages: RwLock::new(HashMap::new()),
        }
    }

    /// Chunk id for a package slice. Ids are `share_key:index`.
    fn chunk_id(share_key: &str, index: usize) -> String {
        format!("{}:{}", share_key, index)
    }

    /// Index an on-disk artifact so its chunks can be served to peers.
    /// Returns the chunk ids in order.
    pub fn register_artifact(&self, share_key: &str, path: &Path) -> DepotResult<Vec<String>> {
        let mut file = File::open(path)?;
        let mut chunks = Vec::new();
        let mut buffer = vec![0u8; self.chunk_size as usize];
        let mut offset = 0u64;

        loop {
            let read = read_up_to(&mut file, &mut buffer)?;
            if read == 0 {
                break;
            }
            let digest = Sha256::digest(&buffer[..read]);
            chunks.push(ChunkMeta {
                id: Self::chunk_id(share_key, chunks.len()),
                offset,
                len: read as u64,
                sha256: hex::encode(digest),
                path: path.to_path_buf(),
            });
            offset += read as u64;
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        debug!(package = share_key, chunks = ids.len(), "registered artifact");
        self.packages.write().insert(share_key.to_string(), chunks);
        Ok(ids)
    }

    /// Chunk ids for a shared package, if we share it.
    pub fn chunk_ids(&self, share_key: &str) -> Option<Vec<String>> {
        self.packages
            .read()
            .get(share_key)
            .map(|chunks| chunks.iter().map(|c| c.id.clone()).collect())
    }

    /// All share keys this node can serve.
    pub fn shared_package_keys(&self) -> Vec<String> {
        self.packages.read().keys().cloned().collect()
    }

    /// Read and verify one chunk's bytes.
    pub fn read_chunk(&self, share_key: &str, chunk_id: &str) -> DepotResult<Vec<u8>> {
        let meta = {
            let packages = self.packages.read();
            packages
                .get(share_key)
                .and_then(|chunks| chunks.iter().find(|c| c.id == chunk_id))
                .cloned()
                .ok_or_else(|| DepotError::ChunkNotFound {
                    chunk_id: chunk_id.to_string(),
                })?
        };

        let mut file = File::open(&meta.path)?;
        file.seek(SeekFrom::Start(meta.offset))?;
        let mut bytes = vec![0u8; meta.len as usize];
        file.read_exact(&mut bytes)?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != meta.sha256 {
            return Err(DepotError::ChecksumMismatch {
                package: share_key.to_string(),
                expected: meta.sha256,
                actual: digest,
            });
        }
        Ok(bytes)
    }

    /// The index encoded in a chunk id, used to order received chunks.
    pub fn chunk_index(chunk_id: &str) -> Option<usize> {
        chunk_id.rsplit(':').next()?.parse().ok()
    }
}

/// Read until the buffer is full or EOF; plain `read` may return short.
fn read_up_to(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
