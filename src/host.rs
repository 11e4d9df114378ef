//! Host Signals Module
//!
//! Delivers host lifecycle events (memory pressure, background
//! transition) to subscribed caches over broadcast channels.
//!
//! Hosts without such signals simply never construct a hub; caches also
//! accept direct delivery through their `handle_*` methods.

use tokio::sync::broadcast;

const SIGNAL_CHANNEL_CAPACITY: usize = 16;

// == Host Signals ==
/// A clonable hub that fans host lifecycle events out to every attached
/// cache.
///
/// ```no_run
/// use tiercache::{HostSignals, MemoryCache, MemoryCacheConfig};
///
/// # async fn wire() {
/// let signals = HostSignals::new();
/// let cache: MemoryCache<String, Vec<u8>> =
///     MemoryCache::new(MemoryCacheConfig::default());
/// cache.attach_host_signals(&signals);
///
/// // Delivered by the platform integration layer:
/// signals.notify_memory_pressure();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HostSignals {
    memory_pressure: broadcast::Sender<()>,
    did_enter_background: broadcast::Sender<()>,
}

impl HostSignals {
    pub fn new() -> Self {
        let (memory_pressure, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let (did_enter_background, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            memory_pressure,
            did_enter_background,
        }
    }

    /// Announces a host low-memory condition to every subscriber.
    pub fn notify_memory_pressure(&self) {
        let _ = self.memory_pressure.send(());
    }

    /// Announces a host background transition to every subscriber.
    pub fn notify_did_enter_background(&self) {
        let _ = self.did_enter_background.send(());
    }

    pub(crate) fn subscribe_memory_pressure(&self) -> broadcast::Receiver<()> {
        self.memory_pressure.subscribe()
    }

    pub(crate) fn subscribe_did_enter_background(&self) -> broadcast::Receiver<()> {
        self.did_enter_background.subscribe()
    }
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_subscriber() {
        let signals = HostSignals::new();
        let mut rx = signals.subscribe_memory_pressure();

        signals.notify_memory_pressure();

        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_notify_without_subscribers_is_harmless() {
        let signals = HostSignals::new();
        signals.notify_memory_pressure();
        signals.notify_did_enter_background();
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let signals = HostSignals::new();
        let mut pressure = signals.subscribe_memory_pressure();
        let mut background = signals.subscribe_did_enter_background();

        signals.notify_did_enter_background();

        assert!(background.recv().await.is_ok());
        assert!(pressure.try_recv().is_err());
    }
}
