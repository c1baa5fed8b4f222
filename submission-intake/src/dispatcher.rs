//! Delivery of bundles to tester queues.
//!
//! Each send opens a fresh connection, uploads the bundle under its own file
//! name and closes the connection again, whatever the outcome. Nothing is
//! retried here.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use submission_filestore::{FileStore, HostIdentity, SftpParameters};

use crate::config::DispatchConfig;
use crate::course::{CredentialStore, TesterTarget};
use crate::error::{Error, Result};

pub struct Dispatcher {
    credentials: Arc<dyn CredentialStore>,
    known_hosts: Option<PathBuf>,
    timeouts: DispatchConfig,
}

async fn with_timeout<T>(limit: Option<Duration>, stage: &str, work: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    let Some(limit) = limit else {
        return work.await
    };
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{stage} did not finish within {} seconds", limit.as_secs_f32())),
    }
}

impl Dispatcher {
    pub fn new(credentials: Arc<dyn CredentialStore>, known_hosts: Option<PathBuf>, timeouts: DispatchConfig) -> Self {
        Self { credentials, known_hosts, timeouts }
    }

    fn host_identity(&self, target: &TesterTarget) -> Option<HostIdentity> {
        if let Some(fingerprint) = &target.host_key_fingerprint {
            return Some(HostIdentity::Fingerprint(fingerprint.clone()))
        }
        self.known_hosts.clone().map(HostIdentity::KnownHosts)
    }

    /// Upload `bundle` into the tester's queue. The local file is never touched.
    pub async fn send(&self, bundle: &Path, target: &TesterTarget) -> Result<()> {
        let address = target.queue_url()?;
        let failed = |source: anyhow::Error| {
            error!("Could not deliver {} to {address}: {source:#}", bundle.to_string_lossy());
            Error::DispatchFailed { target: target.name.clone(), bundle: bundle.to_owned(), source }
        };

        let Some(name) = bundle.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            return Err(failed(anyhow!("bundle path has no file name")))
        };

        let credentials = if target.local {
            None
        } else {
            let Some(host_identity) = self.host_identity(target) else {
                return Err(failed(anyhow!("no host key fingerprint or known_hosts file to verify {} with", target.hostname)))
            };
            let key = self.credentials.storer_private_key().await?;
            Some(SftpParameters { private_key: key.pem, private_key_password: key.password, host_identity })
        };

        debug!("Connecting to {address}");
        let store = with_timeout(self.timeouts.connect_timeout, "connecting", FileStore::open(&address, credentials))
            .await
            .map_err(failed)?;

        let uploaded = with_timeout(self.timeouts.transfer_timeout, "transfer", store.upload(bundle, &name)).await;
        if let Err(err) = store.close().await {
            warn!("Could not close connection to {address}: {err}");
        }

        uploaded.map_err(failed)?;
        info!("Queued {name} on tester {} at {address}", target.name);
        Ok(())
    }
}
