use std::{
    io,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
};

const ARTIFACT_FILE: &str = "scan.jsonl";

/// Artifacts live at `<root>/<job id>/scan.jsonl`, one directory per job.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, job_id: &str) -> io::Result<PathBuf> {
        let safe = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("job id {job_id:?} cannot be used as an artifact key"),
            ));
        }
        Ok(self.root.join(job_id).join(ARTIFACT_FILE))
    }

    /// Opens a fresh, empty artifact for the job, truncating whatever a previous run left.
    pub async fn prepare(&self, job_id: &str) -> io::Result<ArtifactWriter> {
        let path = self.path_for(job_id)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let file = File::create(&path).await?;
        Ok(ArtifactWriter {
            path,
            file: BufWriter::new(file),
            len: 0,
        })
    }
}

pub struct ArtifactWriter {
    path: PathBuf,
    file: BufWriter<File>,
    len: u64,
}

impl ArtifactWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record line and returns the byte offset it starts at.
    pub async fn append_record(&mut self, raw: &[u8]) -> io::Result<u64> {
        let offset = self.len;
        self.file.write_all(raw).await?;
        self.file.write_all(b"\n").await?;
        self.len += raw.len() as u64 + 1;
        Ok(offset)
    }

    pub fn evidence_ref(&self, offset: u64) -> String {
        format!("{}#{offset}", self.path.display())
    }

    pub async fn finish(mut self) -> io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        Ok(self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    pub len: u64,
    pub sha256: String,
}

/// Hashes the file in fixed-size chunks so large artifacts never sit in memory.
pub async fn digest_file(path: &Path) -> io::Result<ArtifactDigest> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok(ArtifactDigest {
        len,
        sha256: hex::encode(hasher.finalize()),
    })
}
