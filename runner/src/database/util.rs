use super::ConnectionError;
use tracing::error;

/// `<hostname>` of this worker, stored with each reservation so stale claims can be traced back
pub fn holder() -> Result<String, ConnectionError> {
    match nix::unistd::gethostname() {
        Ok(hostname) => Ok(hostname.to_string_lossy().into_owned()),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname for reservation: {error}");

            Err(ConnectionError::Identity(error))
        }
    }
}
