//! Listener certificate manager.
//!
//! Loads the webhook listener's certificate and key, and keeps them current
//! while the process runs:
//!
//! - a watch task polls both files' modification time, size and inode, and
//!   raises a pending reload (a [`Notify`] holds at most one permit, so bursts of
//!   writes collapse into one reload)
//! - a reload task waits out the debounce interval, parses the pair and swaps
//!   it into the shared [`RustlsConfig`]
//!
//! A pair that fails to parse leaves the previous material in service. The
//! reload is retried once after a fixed backoff.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::CertError;

/// Default interval between file checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default delay between a detected change and the reload
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default delay before retrying a failed reload
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Identity of the certificate in service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertMaterial {
    /// SHA-256 of the leaf certificate DER, lowercase hex
    pub fingerprint: String,
    /// Certificates in the chain
    pub chain_len: usize,
}

/// Certificate and key files backing a TLS listener.
#[derive(Debug)]
pub struct CertManager {
    cert_file: PathBuf,
    key_file: PathBuf,
    config: RustlsConfig,
    material: RwLock<Arc<CertMaterial>>,
    poll_interval: Duration,
    debounce: Duration,
    retry_backoff: Duration,
}

impl CertManager {
    /// Loads the pair. Fails when either file is missing or unusable.
    pub async fn load(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Result<Self, CertError> {
        let cert_file = cert_file.into();
        let key_file = key_file.into();
        let (server_config, material) = load_pair(&cert_file, &key_file).await?;
        info!(
            cert = %cert_file.display(),
            fingerprint = %material.fingerprint,
            "Loaded listener certificate"
        );

        Ok(Self {
            cert_file,
            key_file,
            config: RustlsConfig::from_config(Arc::new(server_config)),
            material: RwLock::new(Arc::new(material)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Overrides the poll, debounce and retry intervals.
    #[must_use]
    pub fn with_intervals(mut self, poll_interval: Duration, debounce: Duration, retry_backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.debounce = debounce;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Listener configuration. Clones share the reloadable state.
    #[must_use]
    pub fn rustls_config(&self) -> RustlsConfig {
        self.config.clone()
    }

    /// Material currently in service.
    #[must_use]
    pub fn material(&self) -> Arc<CertMaterial> {
        match self.material.read() {
            Ok(material) => Arc::clone(&material),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Reads the pair again and swaps it in. On error nothing changes.
    pub async fn reload(&self) -> Result<Arc<CertMaterial>, CertError> {
        let (server_config, material) = load_pair(&self.cert_file, &self.key_file).await?;
        let material = Arc::new(material);
        self.config.reload_from_config(Arc::new(server_config));
        match self.material.write() {
            Ok(mut slot) => *slot = Arc::clone(&material),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&material),
        }
        info!(
            cert = %self.cert_file.display(),
            fingerprint = %material.fingerprint,
            "Reloaded listener certificate"
        );
        Ok(material)
    }

    /// Starts the watch and reload tasks. They stop when the returned
    /// handle is dropped or aborted.
    pub fn spawn(self: Arc<Self>) -> CertWatcher {
        let pending = Arc::new(Notify::new());
        let watch = tokio::spawn(Arc::clone(&self).watch(Arc::clone(&pending)));
        let reload = tokio::spawn(self.reload_on_change(pending));
        CertWatcher { watch, reload }
    }

    async fn watch(self: Arc<Self>, pending: Arc<Notify>) {
        let mut last = self.stamp().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let current = self.stamp().await;
            if current != last {
                debug!(cert = %self.cert_file.display(), "Certificate files changed");
                last = current;
                pending.notify_one();
            }
        }
    }

    async fn reload_on_change(self: Arc<Self>, pending: Arc<Notify>) {
        loop {
            pending.notified().await;
            tokio::time::sleep(self.debounce).await;
            let Err(err) = self.reload().await else {
                continue;
            };
            warn!(
                cert = %self.cert_file.display(),
                error = %err,
                retry_in = ?self.retry_backoff,
                "Certificate reload failed, keeping previous certificate"
            );
            tokio::time::sleep(self.retry_backoff).await;
            if let Err(err) = self.reload().await {
                error!(
                    cert = %self.cert_file.display(),
                    error = %err,
                    "Certificate reload retry failed, keeping previous certificate"
                );
            }
        }
    }

    async fn stamp(&self) -> [Option<FileStamp>; 2] {
        [
            FileStamp::read(&self.cert_file).await,
            FileStamp::read(&self.key_file).await,
        ]
    }
}

/// Running watch and reload tasks.
#[derive(Debug)]
pub struct CertWatcher {
    watch: JoinHandle<()>,
    reload: JoinHandle<()>,
}

impl CertWatcher {
    /// Stops both tasks.
    pub fn abort(&self) {
        self.watch.abort();
        self.reload.abort();
    }
}

impl Drop for CertWatcher {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Identity of the file a path resolves to. The inode catches symlink swaps
/// (Kubernetes secret volumes) onto a file with the same size and mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    async fn read(path: &Path) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            inode: inode(&metadata),
        })
    }
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

async fn load_pair(cert_file: &Path, key_file: &Path) -> Result<(ServerConfig, CertMaterial), CertError> {
    let cert_pem = tokio::fs::read(cert_file).await?;
    let key_pem = tokio::fs::read(key_file).await?;
    server_config(&cert_pem, &key_pem)
}

/// Builds a listener configuration from PEM bytes.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<(ServerConfig, CertMaterial), CertError> {
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Pem(format!("certificate: {e}")))?;
    let Some(leaf) = chain.first() else {
        return Err(CertError::Pem("no certificate found".to_string()));
    };
    let material = CertMaterial {
        fingerprint: fingerprint(leaf),
        chain_len: chain.len(),
    };
    let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| CertError::Pem(format!("private key: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok((config, material))
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref()).iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pair(name: &str) -> (String, String) {
        let key = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (key.cert.pem(), key.signing_key.serialize_pem())
    }

    #[test]
    fn test_server_config_from_pem() {
        let (cert, key) = pair("localhost");
        let (config, material) = server_config(cert.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(material.chain_len, 1);
        assert_eq!(material.fingerprint.len(), 64);
    }

    #[test]
    fn test_server_config_rejects_garbage() {
        let (cert, _) = pair("localhost");
        assert!(matches!(
            server_config(b"not pem", b"not pem"),
            Err(CertError::Pem(_))
        ));
        assert!(matches!(
            server_config(cert.as_bytes(), b"not pem"),
            Err(CertError::Pem(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_keeps_material_on_bad_write() {
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("tls.crt");
        let key_file = dir.path().join("tls.key");
        let (cert, key) = pair("localhost");
        std::fs::write(&cert_file, &cert).unwrap();
        std::fs::write(&key_file, &key).unwrap();

        let manager = CertManager::load(&cert_file, &key_file).await.unwrap();
        let before = manager.material();

        std::fs::write(&cert_file, "truncated").unwrap();
        assert!(manager.reload().await.is_err());
        assert_eq!(manager.material(), before);

        let (cert, key) = pair("rotated");
        std::fs::write(&cert_file, &cert).unwrap();
        std::fs::write(&key_file, &key).unwrap();
        let after = manager.reload().await.unwrap();
        assert_ne!(after.fingerprint, before.fingerprint);
        assert_eq!(manager.material(), after);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertManager::load(dir.path().join("tls.crt"), dir.path().join("tls.key")).await;
        assert!(matches!(result, Err(CertError::Io(_))));
    }

    #[tokio::test]
    async fn test_watcher_picks_up_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("tls.crt");
        let key_file = dir.path().join("tls.key");
        let (cert, key) = pair("localhost");
        std::fs::write(&cert_file, &cert).unwrap();
        std::fs::write(&key_file, &key).unwrap();

        let manager = Arc::new(
            CertManager::load(&cert_file, &key_file)
                .await
                .unwrap()
                .with_intervals(Duration::from_millis(20), Duration::from_millis(20), Duration::from_millis(20)),
        );
        let before = manager.material();
        let _watcher = Arc::clone(&manager).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (cert, key) = pair("rotated");
        std::fs::write(&key_file, &key).unwrap();
        std::fs::write(&cert_file, &cert).unwrap();

        let mut rotated = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if manager.material() != before {
                rotated = true;
                break;
            }
        }
        assert!(rotated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stamp_sees_symlink_swap() {
        let dir = tempfile::tempdir().unwrap();
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for (name, fill) in [("first", "a"), ("second", "b")] {
            let file = dir.path().join(name);
            std::fs::write(&file, fill.repeat(64)).unwrap();
            std::fs::File::options().write(true).open(&file).unwrap().set_modified(modified).unwrap();
        }

        let link = dir.path().join("tls.crt");
        std::os::unix::fs::symlink(dir.path().join("first"), &link).unwrap();
        let before = FileStamp::read(&link).await.unwrap();

        let staged = dir.path().join("tls.crt.tmp");
        std::os::unix::fs::symlink(dir.path().join("second"), &staged).unwrap();
        std::fs::rename(&staged, &link).unwrap();
        let after = FileStamp::read(&link).await.unwrap();

        assert_eq!((before.modified, before.len), (after.modified, after.len));
        assert_ne!(before, after);
    }
}
