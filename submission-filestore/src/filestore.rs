use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use percent_encoding::percent_decode_str;

use crate::transport::Transport;
use crate::transport::local::LocalTransport;
use crate::transport::sftp::{SftpParameters, TransportSftp};

const DEFAULT_SSH_PORT: u16 = 22;

/// A connection to a single queue directory, addressed by url.
///
/// Supported schemes are `file:///path/to/queue` for a queue on this host and
/// `sftp://user@host:port/path/to/queue` for a remote tester.
#[derive(Debug)]
pub struct FileStore {
    transport: Box<dyn Transport>,
}

impl FileStore {
    /// Open a connection to the given url. SFTP urls require credentials.
    pub async fn open(address: &str, credentials: Option<SftpParameters>) -> Result<FileStore> {
        Ok(Self {
            transport: Self::create_transport(address, credentials).await?
        })
    }

    async fn create_transport(address: &str, credentials: Option<SftpParameters>) -> Result<Box<dyn Transport>> {
        let url: url::Url = address.parse()?;

        match url.scheme() {
            "file" => {
                if url.host_str().is_some_and(|host| !host.is_empty() && host != "localhost") {
                    bail!("Local file connections can't specify a host.");
                }
                let path = url.to_file_path().map_err(|()| anyhow::anyhow!("Not a usable local path: {address}"))?;
                Ok(Box::new(LocalTransport::new(path)))
            }
            "sftp" => {
                let host = match url.host_str() {
                    Some(host) => host.to_owned(),
                    None => bail!("a host must be provided for sftp connections"),
                };
                if url.password().is_some() {
                    bail!("Password logins are not supported for sftp connections");
                }
                let user = percent_decode_str(url.username()).decode_utf8()?.into_owned();
                if user.is_empty() {
                    bail!("a login must be provided for sftp connections");
                }
                let base = percent_decode_str(url.path()).decode_utf8()?.into_owned();
                let port = url.port().unwrap_or(DEFAULT_SSH_PORT);
                let Some(credentials) = credentials else {
                    bail!("sftp connection to {host} requires a private key");
                };

                debug!("connecting to sftp://{user}@{host}:{port}{base}");
                Ok(Box::new(TransportSftp::new(base, host, user, port, credentials).await?))
            }
            _ => {
                bail!("Not an accepted filestore scheme: {}", url.scheme());
            }
        }
    }

    /// Copy a local file into the queue under the given name.
    pub async fn upload(&self, path: &Path, name: &str) -> Result<()> {
        self.transport.upload(path, name).await
            .with_context(|| format!("Could not upload {} to {:?}", path.to_string_lossy(), self.transport))
    }

    /// Shut down the underlying connection
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
