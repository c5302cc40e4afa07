//! One-time authentication tokens kept as marker files.
//!
//! A token is the hex SHA-1 of `pid,time,headers,secret`. Issuing one
//! creates an empty file named `.<token>` in the token directory;
//! redeeming it deletes that file, so each token authenticates once.
//! Markers that outlive the configured lifetime are removed by
//! [`TokenStore::sweep`].

use crate::config::Config;
use lazy_static::lazy_static;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Leading character of every marker file name.
pub const MARKER_PREFIX: char = '.';

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"^[0-9A-Fa-f]+$").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("exception creating {path} ({source})")]
    Create { path: PathBuf, source: io::Error },
    #[error("error removing {path} ({source})")]
    Remove { path: PathBuf, source: io::Error },
    #[error("error listing {path} ({source})")]
    List { path: PathBuf, source: io::Error },
}

/// What currently sits at a token's marker location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Missing,
    Plain,
    /// A symlink, directory or other special file.
    NotPlain,
}

#[derive(Debug, Clone)]
pub struct Marker {
    pub token: String,
    pub kind: Probe,
    /// Status change time of a plain marker.
    pub changed: Option<SystemTime>,
}

/// Storage for token markers.
pub trait MarkerBackend {
    /// Creates the marker; fails if anything already exists there.
    fn create(&self, token: &str) -> Result<(), StoreError>;

    fn probe(&self, token: &str) -> Probe;

    /// Removes the marker. `Ok(false)` means it was already gone.
    fn remove(&self, token: &str) -> Result<bool, StoreError>;

    /// Every marker currently stored, plain or not.
    fn markers(&self) -> Result<Vec<Marker>, StoreError>;

    /// Human-readable location of a marker, for logs.
    fn locate(&self, token: &str) -> String;
}

/// Markers as zero-byte files in a single directory.
#[derive(Debug, Clone)]
pub struct FsMarkers {
    dir: PathBuf,
}

impl FsMarkers {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{MARKER_PREFIX}{token}"))
    }
}

fn probe_path(path: &Path) -> Probe {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_file() => Probe::Plain,
        Ok(_) => Probe::NotPlain,
        Err(_) => Probe::Missing,
    }
}

#[cfg(unix)]
fn changed_time(meta: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn changed_time(meta: &fs::Metadata) -> Option<SystemTime> {
    meta.modified().ok()
}

impl MarkerBackend for FsMarkers {
    fn create(&self, token: &str) -> Result<(), StoreError> {
        let path = self.path(token);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map(|_| ())
            .map_err(|source| StoreError::Create { path, source })
    }

    fn probe(&self, token: &str) -> Probe {
        probe_path(&self.path(token))
    }

    fn remove(&self, token: &str) -> Result<bool, StoreError> {
        let path = self.path(token);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Remove { path, source }),
        }
    }

    fn markers(&self) -> Result<Vec<Marker>, StoreError> {
        let list_error = |source| StoreError::List {
            path: self.dir.clone(),
            source,
        };

        let mut markers = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(list_error)? {
            let entry = entry.map_err(list_error)?;
            let name = entry.file_name();
            let Some(token) = name
                .to_str()
                .and_then(|name| name.strip_prefix(MARKER_PREFIX))
            else {
                log::trace!("Ignoring file {}.", name.to_string_lossy());
                continue;
            };

            let (kind, changed) = match fs::symlink_metadata(entry.path()) {
                Ok(meta) if meta.file_type().is_file() => (Probe::Plain, changed_time(&meta)),
                Ok(_) => (Probe::NotPlain, None),
                // vanished since the listing
                Err(_) => continue,
            };
            markers.push(Marker {
                token: token.to_string(),
                kind,
                changed,
            });
        }
        Ok(markers)
    }

    fn locate(&self, token: &str) -> String {
        self.path(token).display().to_string()
    }
}

/// Hex SHA-1 over `pid,timestamp,header_block,secret`.
pub fn derive_token(pid: u32, timestamp: f64, header_block: &str, secret: &str) -> String {
    let contents = format!("{pid},{timestamp},{header_block},{secret}");
    hex::encode(Sha1::digest(contents.as_bytes()))
}

/// Redeemable tokens are non-empty hex strings; anything else could name
/// a path outside the marker namespace.
pub fn is_well_formed(token: &str) -> bool {
    TOKEN_RE.is_match(token)
}

pub struct TokenStore<B = FsMarkers> {
    backend: B,
    secret: String,
}

impl TokenStore<FsMarkers> {
    pub fn open(config: &Config) -> Self {
        Self::new(FsMarkers::new(config.token_dir()), config.secret.clone())
    }
}

impl<B: MarkerBackend> TokenStore<B> {
    pub fn new(backend: B, secret: impl Into<String>) -> Self {
        Self {
            backend,
            secret: secret.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mints a token for a message with the given header block and
    /// records its marker.
    pub fn issue(&self, header_block: &str) -> Result<String, StoreError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let token = derive_token(std::process::id(), timestamp, header_block, &self.secret);

        self.backend.create(&token)?;
        log::trace!("Recorded token {}.", self.backend.locate(&token));
        Ok(token)
    }

    /// Consumes `token`. Returns `Ok(true)` only for the one caller whose
    /// removal of a plain marker succeeded.
    pub fn redeem(&self, token: &str) -> Result<bool, StoreError> {
        if !is_well_formed(token) {
            log::debug!("Token {token:?} is not a hex digest, not looking it up");
            return Ok(false);
        }

        match self.backend.probe(token) {
            Probe::Missing => return Ok(false),
            Probe::NotPlain => {
                log::warn!(
                    "Warning:  {} is not a regular file, skipping...",
                    self.backend.locate(token)
                );
                return Ok(false);
            }
            Probe::Plain => {}
        }

        log::info!("Matched token {token}, removing.");
        if !self.backend.remove(token)? {
            log::info!("Token {token} was redeemed concurrently.");
            return Ok(false);
        }
        log::trace!("Removed token {token}.");
        Ok(true)
    }

    /// Removes markers at least `max_age` old. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.sweep_at(SystemTime::now(), max_age)
    }

    pub fn sweep_at(&self, now: SystemTime, max_age: Duration) -> Result<usize, StoreError> {
        let mut removed = 0;
        for marker in self.backend.markers()? {
            if marker.kind != Probe::Plain {
                log::warn!(
                    "Warning:  {} is not a regular file, skipping...",
                    self.backend.locate(&marker.token)
                );
                continue;
            }

            let expired = marker
                .changed
                .and_then(|changed| now.duration_since(changed).ok())
                .is_some_and(|age| age >= max_age);
            if !expired {
                continue;
            }

            log::info!("Removing old token {MARKER_PREFIX}{}.", marker.token);
            match self.backend.remove(&marker.token) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Error:  error handling token {MARKER_PREFIX}{} ({e})", marker.token);
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }
}
