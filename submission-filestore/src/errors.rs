//! Errors potentially used by multiple transports

/// The remote host presented a key that doesn't match the configured identity
#[derive(thiserror::Error, Debug)]
#[error("Remote host key for {host} did not match the pinned identity")]
pub struct HostKeyRejected {
    /// Host that presented the key
    pub host: String,
}

/// The remote host refused every credential we offered
#[derive(thiserror::Error, Debug)]
#[error("Authentication as {user} was refused by the remote host")]
pub struct AuthenticationFailed {
    /// Login that was refused
    pub user: String,
}

/// A transfer completed but the remote copy doesn't match the local file
#[derive(thiserror::Error, Debug)]
#[error("Remote copy of {name} is {remote} bytes, expected {expected}")]
pub struct IncompleteTransfer {
    /// Blob name on the remote side
    pub name: String,
    /// Size of the local source
    pub expected: u64,
    /// Size observed on the remote side
    pub remote: u64,
}
