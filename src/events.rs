//! Change notification
//!
//! Successful mutations are recorded in an [`EventPropagator`] and fanned
//! out to listeners only when the owner calls [`EventPropagator::publish`]
//! (`Filesystem::flush_events`). Callers must flush once per unit of work;
//! events that are never flushed are never delivered.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::Result;
use crate::storage::{File, NodeInfo};

/// A change to the logical tree. Carries paths only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    Moved { src: PathBuf, dst: PathBuf },
    Changed { path: PathBuf },
    Deleted { path: PathBuf },
}

impl Event {
    pub fn moved(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Event::Moved {
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Event::Changed { path: path.into() }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Event::Deleted { path: path.into() }
    }

    /// Invoke the listener method matching this event
    pub fn dispatch(&self, listener: &dyn EventListener) {
        match self {
            Event::Moved { src, dst } => listener.moved(src, dst),
            Event::Changed { path } => listener.changed(path),
            Event::Deleted { path } => listener.deleted(path),
        }
    }
}

/// Receiver of change notifications
pub trait EventListener: Send + Sync {
    fn moved(&self, src: &Path, dst: &Path);
    fn changed(&self, path: &Path);
    fn deleted(&self, path: &Path);
}

/// Buffers events and publishes them to listeners on demand
///
/// The buffer is an insertion-ordered set: repeating an event before a
/// flush has no effect, and distinct events keep the order in which they
/// first occurred.
#[derive(Default)]
pub struct EventPropagator {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    events: Mutex<IndexSet<Event>>,
}

impl EventPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are invoked in registration order.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn add_event(&self, event: Event) {
        trace!("buffering event {:?}", event);
        self.events.lock().insert(event);
    }

    /// Deliver every buffered event to every listener, then clear the buffer.
    ///
    /// The buffer is swapped out under the lock, so each event is handed to
    /// exactly one publish call even when flushes race.
    pub fn publish(&self) {
        let events = std::mem::take(&mut *self.events.lock());
        if events.is_empty() {
            return;
        }

        let listeners = self.listeners.read().clone();
        debug!(
            "publishing {} event(s) to {} listener(s)",
            events.len(),
            listeners.len()
        );
        for event in &events {
            for listener in &listeners {
                event.dispatch(listener.as_ref());
            }
        }
    }

    /// Snapshot of the buffered events, in publish order
    pub fn pending(&self) -> Vec<Event> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// File handle wrapper that records one `Changed` event per open/close
/// cycle in which the content was actually modified.
pub struct EventFile {
    inner: Box<dyn File>,
    path: PathBuf,
    propagator: Arc<EventPropagator>,
    dirty: bool,
}

impl EventFile {
    pub fn new(inner: Box<dyn File>, path: PathBuf, propagator: Arc<EventPropagator>) -> Self {
        Self {
            inner,
            path,
            propagator,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[async_trait]
impl File for EventFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        self.inner.read(max).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.inner.write(data).await?;
        if written > 0 {
            self.dirty = true;
        }
        Ok(written)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.inner.seek(pos).await
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        // A missing file is created by the truncate
        let unchanged = !self.dirty
            && matches!(self.inner.stat().await, Ok(info) if !info.is_dir() && info.size() == size);
        self.inner.truncate(size).await?;
        if !unchanged {
            self.dirty = true;
        }
        Ok(())
    }

    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>> {
        self.inner.read_dir().await
    }

    async fn stat(&self) -> Result<NodeInfo> {
        self.inner.stat().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await?;
        if self.dirty {
            self.dirty = false;
            self.propagator.add_event(Event::changed(self.path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;

    /// Listener that records every call as an [`Event`]
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub(crate) events: Mutex<Vec<Event>>,
    }

    impl RecordingListener {
        pub(crate) fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl EventListener for RecordingListener {
        fn moved(&self, src: &Path, dst: &Path) {
            self.events.lock().push(Event::moved(src, dst));
        }

        fn changed(&self, path: &Path) {
            self.events.lock().push(Event::changed(path));
        }

        fn deleted(&self, path: &Path) {
            self.events.lock().push(Event::deleted(path));
        }
    }

    #[test]
    fn test_dedup_preserves_first_occurrence_order() {
        let propagator = EventPropagator::new();
        propagator.add_event(Event::changed("/a"));
        propagator.add_event(Event::deleted("/b"));
        propagator.add_event(Event::changed("/a"));
        propagator.add_event(Event::moved("/c", "/d"));
        propagator.add_event(Event::deleted("/b"));

        assert_eq!(
            propagator.pending(),
            vec![
                Event::changed("/a"),
                Event::deleted("/b"),
                Event::moved("/c", "/d"),
            ]
        );
    }

    #[test]
    fn test_publish_order_and_clear() {
        let propagator = EventPropagator::new();
        let first = Arc::new(RecordingListener::default());
        let second = Arc::new(RecordingListener::default());
        propagator.add_event_listener(first.clone());
        propagator.add_event_listener(second.clone());

        propagator.add_event(Event::changed("/x"));
        propagator.add_event(Event::deleted("/y"));
        propagator.publish();

        let expected = vec![Event::changed("/x"), Event::deleted("/y")];
        assert_eq!(first.take(), expected);
        assert_eq!(second.take(), expected);
        assert!(propagator.pending().is_empty());

        propagator.publish();
        assert!(first.take().is_empty());
    }

    #[test]
    fn test_same_path_different_kinds_are_distinct() {
        let propagator = EventPropagator::new();
        propagator.add_event(Event::changed("/a"));
        propagator.add_event(Event::deleted("/a"));
        assert_eq!(propagator.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_event_file_dirty_tracking() {
        let storage = MemoryStorage::new("mem");
        let propagator = Arc::new(EventPropagator::new());

        // Open and close without writing
        let inner = storage.open(Path::new("/f")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/f"), propagator.clone());
        file.close().await.unwrap();
        assert!(propagator.pending().is_empty());

        // Zero-byte write
        let inner = storage.open(Path::new("/f")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/f"), propagator.clone());
        file.write(b"").await.unwrap();
        assert!(!file.is_dirty());
        file.close().await.unwrap();
        assert!(propagator.pending().is_empty());

        // Several writes, one event
        let inner = storage.open(Path::new("/f")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/f"), propagator.clone());
        file.write(b"one").await.unwrap();
        file.write(b"two").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(propagator.pending(), vec![Event::changed("/f")]);
    }

    #[tokio::test]
    async fn test_event_file_truncate_to_same_size_is_clean() {
        let storage = MemoryStorage::new("mem");
        let propagator = Arc::new(EventPropagator::new());
        let mut seed = storage.open(Path::new("/f")).await.unwrap();
        seed.write(b"abc").await.unwrap();
        seed.close().await.unwrap();

        let inner = storage.open(Path::new("/f")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/f"), propagator.clone());
        file.truncate(3).await.unwrap();
        assert!(!file.is_dirty());
        file.close().await.unwrap();
        assert!(propagator.pending().is_empty());

        let inner = storage.open(Path::new("/f")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/f"), propagator.clone());
        file.truncate(1).await.unwrap();
        assert!(file.is_dirty());
        file.close().await.unwrap();
        assert_eq!(propagator.pending(), vec![Event::changed("/f")]);
    }

    #[tokio::test]
    async fn test_event_file_truncate_creates_missing_file() {
        let storage = MemoryStorage::new("mem");
        let propagator = Arc::new(EventPropagator::new());

        let inner = storage.open(Path::new("/new")).await.unwrap();
        let mut file = EventFile::new(inner, PathBuf::from("/new"), propagator.clone());
        file.truncate(0).await.unwrap();
        file.close().await.unwrap();

        assert!(storage.exists(Path::new("/new")).await.unwrap());
        assert_eq!(propagator.pending(), vec![Event::changed("/new")]);
    }

    #[test]
    fn test_concurrent_flushes_deliver_each_event_once() {
        let propagator = Arc::new(EventPropagator::new());
        let listener = Arc::new(RecordingListener::default());
        propagator.add_event_listener(listener.clone());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let propagator = propagator.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        propagator.add_event(Event::changed(format!("/t{}/{}", i, j)));
                        if j % 10 == 0 {
                            propagator.publish();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        propagator.publish();

        let delivered = listener.take();
        assert_eq!(delivered.len(), 400);
        let unique: std::collections::HashSet<_> = delivered.into_iter().collect();
        assert_eq!(unique.len(), 400);
    }
}
