use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::{debug, warn};
use russh::client::Handler;
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::{AuthenticationFailed, HostKeyRejected, IncompleteTransfer};
use crate::transport::{partial_name, validate_name, Transport};

const BUFFER_SIZE: usize = 1 << 14;

/// How the identity of the remote host is established before any credential is sent.
///
/// There is deliberately no variant that accepts an unknown host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostIdentity {
    /// A key fingerprint in OpenSSH notation, eg. `SHA256:AbC...`
    Fingerprint(String),
    /// A known_hosts file that must already list the host. Nothing is ever written to it.
    KnownHosts(PathBuf),
}

pub struct SftpParameters {
    pub private_key: String,
    pub private_key_password: Option<String>,
    pub host_identity: HostIdentity,
}

pub struct TransportSftp {
    host: String,
    port: u16,
    user: String,
    base: String,
    session: russh::client::Handle<ConnectionHandler>,
    client: SftpSession,
}

impl std::fmt::Debug for TransportSftp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let url = format!("sftp://{}@{}:{}{}", self.user, self.host, self.port, self.base);
        f.debug_struct("TransportSFTP").field("url", &url).finish()
    }
}

struct ConnectionHandler {
    host: String,
    port: u16,
    identity: HostIdentity,
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &russh::keys::ssh_key::PublicKey) -> Result<bool, Self::Error> {
        let accepted = match &self.identity {
            HostIdentity::Fingerprint(expected) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                debug!("host {} presented key {actual}", self.host);
                actual == expected.trim()
            },
            HostIdentity::KnownHosts(path) => {
                russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)?
            },
        };
        if !accepted {
            warn!("Rejecting host key presented by {}:{}", self.host, self.port);
            return Err(HostKeyRejected { host: self.host.clone() }.into())
        }
        Ok(true)
    }
}

impl TransportSftp {
    pub async fn new(base: String, host: String, user: String, port: u16, params: SftpParameters) -> Result<Self> {
        debug!("SFTP to {user}@{host}:{port}{base}; private_key_password ({})", params.private_key_password.is_some());

        let config = Arc::new(russh::client::Config::default());
        let handler = ConnectionHandler {
            host: host.clone(),
            port,
            identity: params.host_identity,
        };
        let mut session = russh::client::connect(config, (host.clone(), port), handler).await?;

        let mut private_key = russh::keys::PrivateKey::from_openssh(params.private_key)?;
        if private_key.is_encrypted() {
            match params.private_key_password {
                Some(pass) => private_key = private_key.decrypt(pass)?,
                None => bail!("Private key is encrypted but no passphrase was configured"),
            }
        }

        let hash_alg = match session.best_supported_rsa_hash().await? {
            Some(Some(hash)) => Some(hash),
            Some(None) => bail!("No supported hash for private key login"), // Server does tell us, it doesn't support anything
            None => None, // server doesn't tell us anything, might still be fine
        };

        let auth = session.authenticate_publickey(&user, PrivateKeyWithHashAlg::new(Arc::new(private_key), hash_alg)).await?;
        if !auth.success() {
            return Err(AuthenticationFailed { user }.into())
        }

        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        Ok(Self {
            client: sftp,
            session,
            base,
            host,
            port,
            user,
        })
    }
}

impl TransportSftp {
    fn normalize(&self, name: &str) -> Result<String> {
        let name = validate_name(name)?;
        let s = if self.base.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", self.base.trim_end_matches('/'), name)
        };
        debug!("sftp normalized: {} -> {}", name, s);
        return Ok(s)
    }

    async fn make_dirs(&self) -> Result<()> {
        let absolute = self.base.starts_with('/');
        let mut build_path = if absolute { String::from("/") } else { String::new() };
        for dir in self.base.split('/') {
            if dir.is_empty() { continue }
            build_path += dir;
            _ = self.client.create_dir(&build_path).await;
            build_path += "/";
        }
        Ok(())
    }

    async fn write_partial(&self, src: &mut tokio::fs::File, partial: &str) -> Result<u64> {
        let mut dest = self.client.open_with_flags(partial, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE).await?;

        let mut buffer = vec![0; BUFFER_SIZE];
        let mut total = 0;
        loop {
            let len = src.read(&mut buffer).await?;
            if len == 0 { break }
            dest.write_all(&buffer[0..len]).await?;
            total += len as u64;
        }
        dest.shutdown().await?;
        Ok(total)
    }

    async fn remove_quietly(&self, path: &str) {
        if let Err(err) = self.client.remove_file(path).await {
            debug!("could not remove {path}: {err}");
        }
    }
}

#[async_trait]
impl Transport for TransportSftp {
    async fn upload(&self, src: &Path, name: &str) -> Result<()> {
        let mut src = tokio::fs::OpenOptions::new().read(true).create(false).open(src).await?;
        let expected = src.metadata().await?.len();

        let dest = self.normalize(name)?;
        let partial = self.normalize(&partial_name(name))?;
        self.make_dirs().await?;

        if let Err(err) = self.write_partial(&mut src, &partial).await {
            self.remove_quietly(&partial).await;
            return Err(err)
        }

        let remote = self.client.metadata(&partial).await?.len();
        if remote != expected {
            self.remove_quietly(&partial).await;
            return Err(IncompleteTransfer { name: name.to_owned(), expected, remote }.into())
        }

        // the queue only ever sees the finished file under its real name
        self.client.rename(&partial, &dest).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let sftp = self.client.close().await;
        self.session.disconnect(russh::Disconnect::ByApplication, "", "en").await?;
        Ok(sftp?)
    }
}
