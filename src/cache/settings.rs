//! Coordinated settings cache.
//!
//! Lookup order on [`SettingsCache::get`]:
//! 1. This process's memory copy, if younger than the lifetime.
//! 2. A fresh copy in the shared store, adopted into memory.
//! 3. A download, if this caller can take the shared refresh lock.
//! 4. Otherwise wait for the lock holder, polling up to one read timeout's
//!    worth of intervals, and take whatever it stored.
//!
//! At most one download per account is in flight across everything sharing
//! the store. A caller that cannot get fresh settings falls back to the most
//! recent stale copy; `None` means settings were never obtained.

use crate::cache::format::{
    encode_timestamp, CachedSettings, LockState, LAST_STORE_KEY, SETTINGS_KEY,
};
use crate::cache::store::SharedStore;
use crate::client::http::{settings_url, VendorClient};
use crate::clock::Clock;
use crate::config::AdapterConfig;
use crate::protocol::models::SettingsDocument;
use crate::AdapterError;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Default wait between lock polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of trying to become the refresher.
enum Attempt {
    Fetched(Arc<SettingsDocument>),
    Failed,
    Busy,
}

/// Holds the shared refresh lock and releases it when dropped.
struct RefreshGuard<'a> {
    store: &'a dyn SharedStore,
}

impl<'a> RefreshGuard<'a> {
    fn acquire(store: &'a dyn SharedStore, stale_after: Duration) -> Result<Option<Self>, AdapterError> {
        Ok(store.try_lock(stale_after)?.then_some(Self { store }))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock() {
            tracing::error!(error = %e, "failed to release settings lock");
        }
    }
}

/// Settings cache for one account.
pub struct SettingsCache {
    settings_url: String,
    account: String,
    lifetime_seconds: i64,
    read_timeout: Duration,
    poll_interval: Duration,
    store: Arc<dyn SharedStore>,
    client: Arc<dyn VendorClient>,
    clock: Arc<dyn Clock>,
    memory: RwLock<Option<CachedSettings>>,
}

impl SettingsCache {
    /// Create a cache for the configured account.
    pub fn new(
        config: &AdapterConfig,
        store: Arc<dyn SharedStore>,
        client: Arc<dyn VendorClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings_url: settings_url(config),
            account: config.account.clone(),
            lifetime_seconds: config.settings_lifetime_seconds(),
            read_timeout: config.read_timeout(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            store,
            client,
            clock,
            memory: RwLock::new(None),
        }
    }

    /// Override the wait between lock polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// A lock older than this belongs to a refresher that died.
    pub fn stale_lock_after(&self) -> Duration {
        self.read_timeout * 2 + Duration::from_secs(1)
    }

    /// Current settings, downloading or waiting as needed.
    pub fn get(&self) -> Option<Arc<SettingsDocument>> {
        if let Some(document) = self.fresh_copy() {
            return Some(document);
        }

        match self.attempt_refresh() {
            Attempt::Fetched(document) => return Some(document),
            Attempt::Failed => return self.stale_copy(),
            Attempt::Busy => {}
        }

        let released = self.wait_for_refresher();

        if let Some(document) = self.fresh_copy() {
            return Some(document);
        }

        if released {
            // The holder finished without storing anything: its download failed.
            if let Attempt::Fetched(document) = self.attempt_refresh() {
                return Some(document);
            }
        } else {
            tracing::warn!(
                account = %self.account,
                "settings refresh still running elsewhere, continuing with cached settings"
            );
        }

        self.stale_copy()
    }

    /// The memory copy, whatever its age.
    pub fn cached(&self) -> Option<CachedSettings> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fresh_copy(&self) -> Option<Arc<SettingsDocument>> {
        if let Some(cached) = self.cached() {
            if cached.is_fresh(self.lifetime_seconds, self.clock.as_ref()) {
                return Some(cached.document);
            }
        }

        let stored = self.stored_copy()?;
        if !stored.is_fresh(self.lifetime_seconds, self.clock.as_ref()) {
            return None;
        }

        tracing::debug!(account = %self.account, "adopting settings from shared store");
        let document = stored.document.clone();
        self.remember(stored);
        Some(document)
    }

    fn stale_copy(&self) -> Option<Arc<SettingsDocument>> {
        let copy = self.cached().or_else(|| self.stored_copy());
        match &copy {
            Some(cached) => tracing::warn!(
                account = %self.account,
                age_seconds = cached.age_seconds(self.clock.as_ref()),
                "using stale settings"
            ),
            None => tracing::error!(account = %self.account, "no settings available"),
        }
        copy.map(|cached| cached.document)
    }

    fn stored_copy(&self) -> Option<CachedSettings> {
        let read = || -> Result<Option<CachedSettings>, AdapterError> {
            let Some(timestamp) = self.store.read(LAST_STORE_KEY)? else {
                return Ok(None);
            };
            let Some(json) = self.store.read(SETTINGS_KEY)? else {
                return Ok(None);
            };
            CachedSettings::from_store(&json, &timestamp).map(Some)
        };

        read().unwrap_or_else(|e| {
            tracing::warn!(account = %self.account, error = %e, "ignoring unreadable stored settings");
            None
        })
    }

    fn attempt_refresh(&self) -> Attempt {
        let _guard = match RefreshGuard::acquire(self.store.as_ref(), self.stale_lock_after()) {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => return Attempt::Busy,
            Err(e) if self.cached().is_some() || self.stored_copy().is_some() => {
                tracing::warn!(error = %e, "settings lock unavailable, keeping cached settings");
                return Attempt::Failed;
            }
            Err(e) => {
                tracing::warn!(error = %e, "settings lock unavailable and nothing cached, downloading without it");
                None
            }
        };

        // Another refresher may have finished between our check and the lock.
        if let Some(document) = self.fresh_copy() {
            return Attempt::Fetched(document);
        }

        match self.download() {
            Ok(document) => Attempt::Fetched(document),
            Err(e) => {
                tracing::error!(account = %self.account, error = %e, "settings download failed");
                Attempt::Failed
            }
        }
    }

    fn download(&self) -> Result<Arc<SettingsDocument>, AdapterError> {
        tracing::debug!(account = %self.account, "downloading settings");

        let json = self.client.get_text(&self.settings_url)?;
        let document = Arc::new(SettingsDocument::from_json(&json)?);
        let fetched_at = self.clock.now_utc();

        self.remember(CachedSettings::new(document.clone(), fetched_at));

        let stored = self
            .store
            .write(SETTINGS_KEY, &json)
            .and_then(|()| self.store.write(LAST_STORE_KEY, &encode_timestamp(fetched_at)));
        if let Err(e) = stored {
            tracing::warn!(error = %e, "failed to share downloaded settings");
        }

        tracing::debug!(
            account = %self.account,
            queues = document.queues.len(),
            "settings refreshed"
        );
        Ok(document)
    }

    /// Poll until the lock is released. Returns `false` on timeout.
    fn wait_for_refresher(&self) -> bool {
        let polls = self.read_timeout.as_secs().max(1);
        for _ in 0..polls {
            std::thread::sleep(self.poll_interval);
            match self.store.lock_state() {
                Ok(LockState::Unlocked) => return true,
                Ok(LockState::Locked) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "cannot read settings lock");
                    return false;
                }
            }
        }
        false
    }

    fn remember(&self, cached: CachedSettings) {
        *self.memory.write().unwrap_or_else(PoisonError::into_inner) = Some(cached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::clock::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SALE: &str = r#"{"queues":[{"name":"acme-sale"}]}"#;
    const CHECKOUT: &str = r#"{"queues":[{"name":"acme-checkout"}]}"#;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<String, AdapterError>>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String, AdapterError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                urls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.urls.lock().unwrap().len()
        }
    }

    impl VendorClient for ScriptedClient {
        fn get_text(&self, url: &str) -> Result<String, AdapterError> {
            self.urls.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(AdapterError::Transport("no scripted response".to_string()));
            }
            responses.remove(0)
        }
    }

    fn config() -> AdapterConfig {
        let mut config = AdapterConfig::new("acme", "s3cret");
        config.read_timeout_seconds = 2;
        config
    }

    fn cache(
        store: Arc<MemoryStore>,
        client: Arc<ScriptedClient>,
        clock: Arc<MockClock>,
    ) -> SettingsCache {
        SettingsCache::new(&config(), store, client, clock)
            .with_poll_interval(Duration::from_millis(5))
    }

    fn first_queue(document: &SettingsDocument) -> &str {
        &document.queues[0].name
    }

    #[test]
    fn test_first_get_downloads_and_shares() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(SALE.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store.clone(), client.clone(), clock);

        let document = cache.get().unwrap();
        assert_eq!(first_queue(&document), "acme-sale");
        assert_eq!(client.calls(), 1);
        assert_eq!(
            client.urls.lock().unwrap()[0],
            "https://files.queue-fair.net/acme/s3cret/queue-fair-settings.json"
        );
        assert_eq!(store.read(SETTINGS_KEY).unwrap().as_deref(), Some(SALE));
        assert_eq!(
            store.read(LAST_STORE_KEY).unwrap().as_deref(),
            Some("2025-01-15T12:00:00+00:00")
        );
        assert_eq!(store.lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_memory_copy_served_within_lifetime() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(SALE.to_string()), Ok(CHECKOUT.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client.clone(), clock.clone());

        let first = cache.get().unwrap();
        clock.advance(chrono::Duration::seconds(299));
        let second = cache.get().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn test_expired_copy_is_refreshed() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Ok(SALE.to_string()), Ok(CHECKOUT.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client.clone(), clock.clone());

        cache.get().unwrap();
        clock.advance(chrono::Duration::seconds(300));
        let refreshed = cache.get().unwrap();

        assert_eq!(first_queue(&refreshed), "acme-checkout");
        assert_eq!(client.calls(), 2);
    }

    #[test]
    fn test_fresh_store_copy_adopted_without_download() {
        let store = Arc::new(MemoryStore::new());
        store.write(SETTINGS_KEY, CHECKOUT).unwrap();
        store
            .write(LAST_STORE_KEY, "2025-01-15T11:58:00+00:00")
            .unwrap();
        let client = ScriptedClient::new(vec![]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client.clone(), clock);

        let document = cache.get().unwrap();
        assert_eq!(first_queue(&document), "acme-checkout");
        assert_eq!(client.calls(), 0);
        assert!(cache.cached().is_some());
    }

    #[test]
    fn test_failed_download_keeps_stale_copy_and_unlocks() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![
            Ok(SALE.to_string()),
            Err(AdapterError::Transport("timed out".to_string())),
        ]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store.clone(), client.clone(), clock.clone());

        cache.get().unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let stale = cache.get().unwrap();

        assert_eq!(first_queue(&stale), "acme-sale");
        assert_eq!(client.calls(), 2);
        assert_eq!(store.lock_state().unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_invalid_document_keeps_previous_copy() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![
            Ok(SALE.to_string()),
            Ok(r#"{"queues":[{"name":"q"},{"name":"q"}]}"#.to_string()),
        ]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store.clone(), client, clock.clone());

        cache.get().unwrap();
        clock.advance(chrono::Duration::minutes(10));

        assert_eq!(first_queue(&cache.get().unwrap()), "acme-sale");
        assert_eq!(store.read(SETTINGS_KEY).unwrap().as_deref(), Some(SALE));
    }

    #[test]
    fn test_never_loaded_is_none() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![Err(AdapterError::Transport("refused".to_string()))]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client, clock);

        assert!(cache.get().is_none());
    }

    #[test]
    fn test_waiter_gives_up_on_held_lock_without_downloading() {
        let store = Arc::new(MemoryStore::new());
        store.write(SETTINGS_KEY, SALE).unwrap();
        store
            .write(LAST_STORE_KEY, "2025-01-15T11:00:00+00:00")
            .unwrap();
        assert!(store.try_lock(Duration::from_secs(60)).unwrap());

        let client = ScriptedClient::new(vec![Ok(CHECKOUT.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client.clone(), clock);

        let stale = cache.get().unwrap();
        assert_eq!(first_queue(&stale), "acme-sale");
        assert_eq!(client.calls(), 0);
    }

    #[test]
    fn test_stale_lock_threshold() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(vec![]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = cache(store, client, clock);
        assert_eq!(cache.stale_lock_after(), Duration::from_secs(5));
    }

    /// Shares values but cannot take the refresh lock.
    struct LocklessStore(MemoryStore);

    impl SharedStore for LocklessStore {
        fn read(&self, key: &str) -> Result<Option<String>, AdapterError> {
            self.0.read(key)
        }
        fn write(&self, key: &str, value: &str) -> Result<(), AdapterError> {
            self.0.write(key, value)
        }
        fn try_lock(&self, _stale_after: Duration) -> Result<bool, AdapterError> {
            Err(AdapterError::CacheIO("lock directory not writable".to_string()))
        }
        fn unlock(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn lock_state(&self) -> Result<LockState, AdapterError> {
            self.0.lock_state()
        }
    }

    #[test]
    fn test_lock_error_downloads_only_when_nothing_cached() {
        let store = Arc::new(LocklessStore(MemoryStore::new()));
        let client = ScriptedClient::new(vec![Ok(SALE.to_string()), Ok(CHECKOUT.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = SettingsCache::new(&config(), store, client.clone(), clock.clone())
            .with_poll_interval(Duration::from_millis(5));

        assert_eq!(first_queue(&cache.get().unwrap()), "acme-sale");
        assert_eq!(client.calls(), 1);

        clock.advance(chrono::Duration::minutes(10));
        for _ in 0..3 {
            assert_eq!(first_queue(&cache.get().unwrap()), "acme-sale");
        }
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn test_lock_error_keeps_stored_copy_in_new_process() {
        let inner = MemoryStore::new();
        inner.write(SETTINGS_KEY, SALE).unwrap();
        inner
            .write(LAST_STORE_KEY, "2025-01-15T11:00:00+00:00")
            .unwrap();
        let client = ScriptedClient::new(vec![Ok(CHECKOUT.to_string())]);
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = SettingsCache::new(&config(), Arc::new(LocklessStore(inner)), client.clone(), clock);

        assert_eq!(first_queue(&cache.get().unwrap()), "acme-sale");
        assert_eq!(client.calls(), 0);
    }

    struct CountingClient {
        calls: AtomicUsize,
    }

    impl VendorClient for CountingClient {
        fn get_text(&self, _url: &str) -> Result<String, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SALE.to_string())
        }
    }

    #[test]
    fn test_lock_released_when_store_write_fails() {
        struct ReadOnlyStore(MemoryStore);

        impl SharedStore for ReadOnlyStore {
            fn read(&self, key: &str) -> Result<Option<String>, AdapterError> {
                self.0.read(key)
            }
            fn write(&self, _key: &str, _value: &str) -> Result<(), AdapterError> {
                Err(AdapterError::CacheIO("read-only".to_string()))
            }
            fn try_lock(&self, stale_after: Duration) -> Result<bool, AdapterError> {
                self.0.try_lock(stale_after)
            }
            fn unlock(&self) -> Result<(), AdapterError> {
                self.0.unlock()
            }
            fn lock_state(&self) -> Result<LockState, AdapterError> {
                self.0.lock_state()
            }
        }

        let store = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let cache = SettingsCache::new(&config(), store.clone(), client.clone(), clock);

        assert!(cache.get().is_some());
        assert!(cache.get().is_some());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.lock_state().unwrap(), LockState::Unlocked);
    }
}
