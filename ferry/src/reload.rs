//! Keeping the address map current
//!
//! Invocations take a snapshot with [`AddressMapHandle::current`] and use it
//! for their whole lifetime. A reload builds a complete new map and swaps the
//! snapshot; if building fails the previous map stays in place.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ferry_common::{Signal, internal};
use ferry_delivery::{AddressMap, BounceRule, MapLoadError};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::broadcast;

/// Where the alias document comes from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum MapSource {
    /// A JSON file, re-read on every reload
    File(PathBuf),
    /// The JSON document itself
    Inline(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ReloadPolicy {
    #[default]
    Never,
    /// Every N seconds
    Interval(u64),
    /// On SIGHUP (serve mode)
    Signal,
}

/// ```ron
/// address_map: (
///     source: File("/etc/ferry/aliases.json"),
///     reload: Interval(300),
/// ),
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressMapConfig {
    pub source: MapSource,
    #[serde(default)]
    pub reload: ReloadPolicy,
}

impl AddressMapConfig {
    /// Read the alias document and build a map from it and `rules`.
    ///
    /// # Errors
    ///
    /// Any [`MapLoadError`]; nothing is partially loaded.
    pub fn load(&self, rules: &[BounceRule]) -> Result<AddressMap, MapLoadError> {
        match &self.source {
            MapSource::File(path) => {
                let document =
                    std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
                AddressMap::from_json(&document, rules)
            }
            MapSource::Inline(document) => AddressMap::from_json(document, rules),
        }
    }

    /// [`Self::load`] without blocking the runtime on the file read.
    ///
    /// # Errors
    ///
    /// Any [`MapLoadError`]; nothing is partially loaded.
    pub async fn load_async(&self, rules: &[BounceRule]) -> Result<AddressMap, MapLoadError> {
        match &self.source {
            MapSource::File(path) => {
                let document = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| io_error(path, source))?;
                AddressMap::from_json(&document, rules)
            }
            MapSource::Inline(document) => AddressMap::from_json(document, rules),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> MapLoadError {
    MapLoadError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug)]
struct Inner {
    current: RwLock<Arc<AddressMap>>,
    config: AddressMapConfig,
    rules: Vec<BounceRule>,
}

/// Shared, swappable address map. Clones refer to the same map.
#[derive(Debug, Clone)]
pub struct AddressMapHandle {
    inner: Arc<Inner>,
}

impl AddressMapHandle {
    /// Load the initial map.
    ///
    /// # Errors
    ///
    /// Fails if the first load fails; there is no previous map to fall back
    /// to.
    pub fn load(config: AddressMapConfig, rules: Vec<BounceRule>) -> Result<Self, MapLoadError> {
        let map = config.load(&rules)?;

        internal!(
            level = INFO,
            version = map.version(),
            aliases = map.len(),
            bounce_rules = map.bounce_rule_count(),
            "Address map loaded"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                current: RwLock::new(Arc::new(map)),
                config,
                rules,
            }),
        })
    }

    /// The map invocations should use right now
    #[must_use]
    pub fn current(&self) -> Arc<AddressMap> {
        Arc::clone(&self.inner.current.read())
    }

    #[must_use]
    pub fn policy(&self) -> ReloadPolicy {
        self.inner.config.reload
    }

    /// Rebuild from the source and swap it in.
    ///
    /// Returns whether the content changed.
    ///
    /// # Errors
    ///
    /// On a [`MapLoadError`] the current map is kept.
    pub fn reload(&self) -> Result<bool, MapLoadError> {
        self.install(self.inner.config.load(&self.inner.rules))
    }

    /// [`Self::reload`] for use on the runtime; the file is read with
    /// `tokio::fs`.
    ///
    /// # Errors
    ///
    /// On a [`MapLoadError`] the current map is kept.
    pub async fn reload_async(&self) -> Result<bool, MapLoadError> {
        self.install(self.inner.config.load_async(&self.inner.rules).await)
    }

    fn install(&self, loaded: Result<AddressMap, MapLoadError>) -> Result<bool, MapLoadError> {
        let map = match loaded {
            Ok(map) => map,
            Err(err) => {
                internal!(
                    level = ERROR,
                    error = %err,
                    version = self.current().version(),
                    "Address map reload failed, keeping current map"
                );
                return Err(err);
            }
        };

        let mut current = self.inner.current.write();
        let changed = current.version() != map.version();
        if changed {
            internal!(
                level = INFO,
                from = current.version(),
                to = map.version(),
                aliases = map.len(),
                "Address map reloaded"
            );
            *current = Arc::new(map);
        }

        Ok(changed)
    }

    /// Reload according to the configured policy until a shutdown signal
    /// arrives or the channel closes.
    ///
    /// `Signal::Reload` triggers a reload under every policy except
    /// [`ReloadPolicy::Never`].
    pub async fn watch(&self, mut signals: broadcast::Receiver<Signal>) {
        let policy = self.policy();
        if policy == ReloadPolicy::Never {
            return;
        }

        let period = match policy {
            ReloadPolicy::Interval(secs) => Duration::from_secs(secs.max(1)),
            // Only signals reload; the ticker is effectively idle.
            _ => Duration::from_secs(u64::from(u32::MAX)),
        };
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.reload_async().await;
                }
                signal = signals.recv() => match signal {
                    Ok(Signal::Reload) => {
                        internal!(level = INFO, "Reload requested");
                        let _ = self.reload_async().await;
                    }
                    Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ferry_common::{Domain, Mailbox};
    use ferry_delivery::{BounceReason, Resolution};
    use pretty_assertions::assert_eq;

    use super::*;

    fn mailbox(s: &str) -> Mailbox {
        Mailbox::parse(s).unwrap()
    }

    fn write(file: &tempfile::NamedTempFile, document: &str) {
        std::fs::write(file.path(), document).unwrap();
    }

    fn handle_for(file: &tempfile::NamedTempFile, reload: ReloadPolicy) -> AddressMapHandle {
        AddressMapHandle::load(
            AddressMapConfig {
                source: MapSource::File(file.path().to_path_buf()),
                reload,
            },
            vec![BounceRule {
                domain: Domain::parse("example.com").unwrap(),
                sender: mailbox("mailer-daemon@example.com"),
                reason: BounceReason::MailboxDoesNotExist,
            }],
        )
        .unwrap()
    }

    #[test]
    fn reload_swaps_in_new_map() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, r#"{"sales@example.com": "ops@company.com"}"#);
        let handle = handle_for(&file, ReloadPolicy::Signal);

        let before = handle.current();
        write(&file, r#"{"sales@example.com": "new@company.com"}"#);
        assert!(handle.reload().unwrap());

        assert_eq!(
            handle.current().resolve(&mailbox("sales@example.com")),
            Resolution::Forward(Arc::from(vec![mailbox("new@company.com")]))
        );
        // Snapshots taken before the reload are unaffected.
        assert_eq!(
            before.resolve(&mailbox("sales@example.com")),
            Resolution::Forward(Arc::from(vec![mailbox("ops@company.com")]))
        );

        assert!(!handle.reload().unwrap());
    }

    #[test]
    fn failed_reload_keeps_current_map() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, r#"{"sales@example.com": "ops@company.com"}"#);
        let handle = handle_for(&file, ReloadPolicy::Signal);
        let version = handle.current().version().to_string();

        write(&file, r#"{"sales@example.com": "a@b.com", "SALES@example.com": "c@d.com"}"#);
        assert!(matches!(handle.reload(), Err(MapLoadError::DuplicateAlias(_))));
        assert_eq!(handle.current().version(), version);

        write(&file, "not json");
        assert!(handle.reload().is_err());
        assert_eq!(handle.current().version(), version);
    }

    #[test]
    fn missing_file_fails_initial_load() {
        let err = AddressMapHandle::load(
            AddressMapConfig {
                source: MapSource::File(PathBuf::from("/nonexistent/aliases.json")),
                reload: ReloadPolicy::Never,
            },
            Vec::new(),
        )
        .unwrap_err();

        assert!(matches!(err, MapLoadError::Io { .. }));
    }

    #[tokio::test]
    async fn async_reload_reads_the_file_again() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, r#"{"sales@example.com": "ops@company.com"}"#);
        let handle = handle_for(&file, ReloadPolicy::Signal);
        let version = handle.current().version().to_string();

        write(&file, "not json");
        assert!(handle.reload_async().await.is_err());
        assert_eq!(handle.current().version(), version);

        write(&file, r#"{"info@example.com": "ops@company.com"}"#);
        assert!(handle.reload_async().await.unwrap());
        assert_eq!(
            handle.current().resolve(&mailbox("info@example.com")),
            Resolution::Forward(Arc::from(vec![mailbox("ops@company.com")]))
        );
    }

    #[tokio::test]
    async fn watch_reloads_on_signal_and_stops_on_shutdown() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, r#"{"sales@example.com": "ops@company.com"}"#);
        let handle = handle_for(&file, ReloadPolicy::Signal);

        let (signals, receiver) = broadcast::channel(4);
        let watcher = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.watch(receiver).await })
        };

        write(&file, r#"{"info@example.com": "ops@company.com"}"#);
        signals.send(Signal::Reload).unwrap();
        signals.send(Signal::Shutdown).unwrap();
        watcher.await.unwrap();

        assert_eq!(
            handle.current().resolve(&mailbox("info@example.com")),
            Resolution::Forward(Arc::from(vec![mailbox("ops@company.com")]))
        );
    }

    #[test]
    fn config_parsing() {
        let config: AddressMapConfig =
            ron::from_str(r#"(source: Inline("{}"), reload: Interval(300))"#).unwrap();
        assert_eq!(config.reload, ReloadPolicy::Interval(300));
        assert_eq!(config.source, MapSource::Inline("{}".to_string()));

        let config: AddressMapConfig =
            ron::from_str(r#"(source: File("/etc/ferry/aliases.json"))"#).unwrap();
        assert_eq!(config.reload, ReloadPolicy::Never);
    }
}
