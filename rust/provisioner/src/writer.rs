//! Writes the signed certificate and its private key to disk for the webhook server.

use std::{
    fs::Permissions,
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tokio::{
    fs::{DirBuilder, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::info;

pub const CERT_FILE_NAME: &str = "tls.crt";
pub const KEY_FILE_NAME: &str = "tls.key";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create certificate directory {}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {}", path.display()))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub struct IdentityWriter {
    dir: PathBuf,
}

impl IdentityWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `tls.crt` and `tls.key`, creating the directory (and its parents) if needed.
    ///
    /// Files are readable by the owner only. The certificate is not removed again if writing
    /// the key fails.
    pub async fn write(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)
            .await
            .context(CreateDirSnafu { path: &self.dir })?;
        write_private_file(&self.dir.join(CERT_FILE_NAME), cert_pem).await?;
        write_private_file(&self.dir.join(KEY_FILE_NAME), key_pem).await?;
        info!(cert.dir = %self.dir.display(), "Wrote serving certificate and key");
        Ok(())
    }
}

async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .await
        .context(WriteFileSnafu { path })?;
    // mode only applies to newly created files
    file.set_permissions(Permissions::from_mode(FILE_MODE))
        .await
        .context(WriteFileSnafu { path })?;
    file.write_all(contents)
        .await
        .context(WriteFileSnafu { path })?;
    file.flush().await.context(WriteFileSnafu { path })
}
