//! Session output multiplexer.
//!
//! Tracks viewer attachments per session id and a bounded ring of recent
//! output chunks. A newly attached viewer gets the ring replayed before any
//! live chunk; replay and broadcast share one lock so nothing is missed or
//! duplicated in between.
//!
//! Viewer presence never affects the session itself. Detaching the last
//! viewer leaves the entry in place so a reconnecting client resumes, until
//! [`SessionRegistry::prune`] drops entries nobody is running or watching.

use bridge_proto::{BridgeEvent, CloseReason, ErrorPayload};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// The viewer went away; it will be dropped from the attachment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("viewer channel closed")]
pub struct ViewerClosed;

/// Something that can receive session events, usually one client socket.
pub trait ViewerChannel: Send {
    fn deliver(&self, event: BridgeEvent) -> Result<(), ViewerClosed>;
}

impl ViewerChannel for mpsc::UnboundedSender<BridgeEvent> {
    fn deliver(&self, event: BridgeEvent) -> Result<(), ViewerClosed> {
        self.send(event).map_err(|_| ViewerClosed)
    }
}

/// Handle returned by [`SessionRegistry::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSnapshot {
    pub session_id: String,
    pub viewers: usize,
    pub buffered: usize,
    pub total_chunks: u64,
    pub ended: Option<CloseReason>,
}

struct Entry {
    buffer: VecDeque<String>,
    viewers: BTreeMap<ViewerId, Box<dyn ViewerChannel>>,
    total_chunks: u64,
    ended: Option<BridgeEvent>,
    touched: Instant,
}

impl Entry {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            viewers: BTreeMap::new(),
            total_chunks: 0,
            ended: None,
            touched: Instant::now(),
        }
    }

    /// Delivers to every viewer, dropping the ones that fail.
    fn fan_out(&mut self, session_id: &str, event: &BridgeEvent) {
        self.viewers.retain(|id, viewer| {
            let ok = viewer.deliver(event.clone()).is_ok();
            if !ok {
                debug!(session_id, viewer = %id, "Dropping disconnected viewer");
            }
            ok
        });
    }

    fn ended_reason(&self) -> Option<CloseReason> {
        match &self.ended {
            Some(BridgeEvent::Closed { reason, .. }) => Some(*reason),
            _ => None,
        }
    }
}

/// Owner of every session-to-viewer mapping.
pub struct SessionRegistry {
    buffer_size: usize,
    next_viewer: AtomicU64,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            next_viewer: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attaches a viewer, replaying buffered output first.
    ///
    /// Attaching to an id with no entry yet creates one, so a viewer may
    /// connect before the session's first output.
    pub fn attach(&self, session_id: &str, viewer: impl ViewerChannel + 'static) -> ViewerId {
        let id = ViewerId(self.next_viewer.fetch_add(1, Ordering::Relaxed));
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(Entry::new);
        entry.touched = Instant::now();

        let replay = entry
            .buffer
            .iter()
            .map(|chunk| BridgeEvent::data(session_id, chunk.as_str()))
            .chain(entry.ended.clone());
        for event in replay {
            if viewer.deliver(event).is_err() {
                debug!(session_id, viewer = %id, "Viewer closed during replay");
                return id;
            }
        }

        entry.viewers.insert(id, Box::new(viewer));
        debug!(
            session_id,
            viewer = %id,
            replayed = entry.buffer.len(),
            viewers = entry.viewers.len(),
            "Viewer attached"
        );
        id
    }

    /// Removes a viewer. The session entry and its buffer stay.
    pub fn detach(&self, session_id: &str, viewer: ViewerId) -> bool {
        let mut sessions = self.lock();
        let removed = sessions.get_mut(session_id).is_some_and(|entry| {
            entry.touched = Instant::now();
            entry.viewers.remove(&viewer).is_some()
        });
        if removed {
            debug!(session_id, viewer = %viewer, "Viewer detached");
        }
        removed
    }

    /// Buffers one chunk and fans it out to every attached viewer.
    pub fn broadcast(&self, session_id: &str, chunk: &str) {
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(Entry::new);
        entry.touched = Instant::now();

        entry.buffer.push_back(chunk.to_string());
        while entry.buffer.len() > self.buffer_size {
            entry.buffer.pop_front();
        }
        entry.total_chunks += 1;

        if !entry.viewers.is_empty() {
            entry.fan_out(session_id, &BridgeEvent::data(session_id, chunk));
        }
    }

    /// Announces a newly spawned process for this id.
    pub fn announce_created(&self, session_id: &str) {
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(Entry::new);
        entry.touched = Instant::now();
        entry.ended = None;
        entry.fan_out(
            session_id,
            &BridgeEvent::SessionCreated {
                session_id: session_id.to_string(),
            },
        );
    }

    /// Sends an event to the viewers of the session it names.
    ///
    /// Events without a session id belong to no viewer and are dropped;
    /// interested callers subscribe to the recovery manager instead.
    pub fn publish(&self, event: &BridgeEvent) {
        let Some(session_id) = event.session_id() else {
            debug!(topic = %event.topic(), "Event names no session, not fanned out");
            return;
        };
        if let Some(entry) = self.lock().get_mut(session_id) {
            entry.fan_out(session_id, event);
        }
    }

    /// The process ended but the id may come back (retry, reopen): notify
    /// viewers and keep both the buffer and the attachments.
    pub fn mark_ended(
        &self,
        session_id: &str,
        reason: CloseReason,
        exit_code: Option<i32>,
        error: Option<ErrorPayload>,
    ) {
        let event = BridgeEvent::Closed {
            session_id: session_id.to_string(),
            reason,
            exit_code,
            error,
        };
        // A released entry stays released; nobody is left to notify
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        entry.touched = Instant::now();
        entry.fan_out(session_id, &event);
        entry.ended = Some(event);
    }

    /// Final close: notify, release every attachment and drop the entry.
    pub fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        let Some(mut entry) = self.lock().remove(session_id) else {
            return false;
        };
        // Viewers already saw the closed event if the process ended earlier
        if entry.ended.is_none() {
            entry.fan_out(session_id, &BridgeEvent::closed(session_id, reason));
        }
        debug!(session_id, released = entry.viewers.len(), "Registry entry closed");
        true
    }

    /// Drops entries with no live process and no viewers that have been
    /// untouched for at least `max_idle`. Returns the dropped ids.
    pub fn prune(&self, max_idle: Duration, is_live: impl Fn(&str) -> bool) -> Vec<String> {
        let mut pruned = Vec::new();
        self.lock().retain(|session_id, entry| {
            let keep = !entry.viewers.is_empty()
                || entry.touched.elapsed() < max_idle
                || is_live(session_id.as_str());
            if !keep {
                pruned.push(session_id.clone());
            }
            keep
        });
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned unwatched registry entries");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn viewer_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map_or(0, |entry| entry.viewers.len())
    }

    /// Buffered chunks for a session, oldest first.
    pub fn buffered(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .get(session_id)
            .map(|entry| entry.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ViewerSnapshot> {
        self.lock().get(session_id).map(|entry| ViewerSnapshot {
            session_id: session_id.to_string(),
            viewers: entry.viewers.len(),
            buffered: entry.buffer.len(),
            total_chunks: entry.total_chunks,
            ended: entry.ended_reason(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn data_of(events: &[BridgeEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Data { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_buffer_keeps_most_recent_chunks_in_order() {
        let registry = SessionRegistry::new(800);
        for i in 0..10_000 {
            registry.broadcast("s1", &format!("chunk {i}"));
        }

        let buffered = registry.buffered("s1");
        assert_eq!(buffered.len(), 800);
        assert_eq!(buffered[0], "chunk 9200");
        assert_eq!(buffered[799], "chunk 9999");
        assert_eq!(registry.snapshot("s1").unwrap().total_chunks, 10_000);
    }

    #[test]
    fn test_late_joiner_gets_history_then_live() {
        let registry = SessionRegistry::new(100);
        registry.broadcast("s1", "one");
        registry.broadcast("s1", "two");

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach("s1", tx);
        registry.broadcast("s1", "three");

        assert_eq!(data_of(&drain(&mut rx)), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_failing_viewer_removed_without_affecting_others() {
        let registry = SessionRegistry::new(100);
        let (good_tx, mut good_rx) = mpsc::unbounded_channel();
        let (bad_tx, bad_rx) = mpsc::unbounded_channel();
        registry.attach("s1", good_tx);
        registry.attach("s1", bad_tx);
        assert_eq!(registry.viewer_count("s1"), 2);

        drop(bad_rx);
        registry.broadcast("s1", "hello");

        assert_eq!(registry.viewer_count("s1"), 1);
        assert_eq!(data_of(&drain(&mut good_rx)), vec!["hello"]);
    }

    #[test]
    fn test_detaching_last_viewer_keeps_session() {
        let registry = SessionRegistry::new(100);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.attach("s1", tx);
        registry.broadcast("s1", "kept");

        assert!(registry.detach("s1", id));
        assert!(!registry.detach("s1", id));
        assert!(registry.contains("s1"));
        assert_eq!(registry.buffered("s1"), vec!["kept"]);
    }

    #[test]
    fn test_mark_ended_keeps_viewers_and_replays_to_late_joiners() {
        let registry = SessionRegistry::new(100);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach("s1", tx);
        registry.broadcast("s1", "out");
        registry.mark_ended("s1", CloseReason::Exited, Some(0), None);

        assert_eq!(registry.viewer_count("s1"), 1);
        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(BridgeEvent::Closed { reason: CloseReason::Exited, exit_code: Some(0), .. })
        ));

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        registry.attach("s1", late_tx);
        let late = drain(&mut late_rx);
        assert_eq!(late.len(), 2);
        assert_eq!(late[1].topic(), "session.closed");
        assert_eq!(registry.snapshot("s1").unwrap().ended, Some(CloseReason::Exited));

        registry.announce_created("s1");
        assert_eq!(registry.snapshot("s1").unwrap().ended, None);
    }

    #[test]
    fn test_close_notifies_and_releases() {
        let registry = SessionRegistry::new(100);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach("s1", tx);

        assert!(registry.close("s1", CloseReason::Stopped));
        assert!(!registry.contains("s1"));
        assert!(!registry.close("s1", CloseReason::Stopped));

        let events = drain(&mut rx);
        assert_eq!(events, vec![BridgeEvent::closed("s1", CloseReason::Stopped)]);
        // Sender was dropped with the entry
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_prune_drops_only_unwatched_stale_entries() {
        let registry = SessionRegistry::new(10);
        registry.broadcast("ended", "out");
        registry.mark_ended("ended", CloseReason::Exited, Some(0), None);
        registry.broadcast("live", "out");
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach("watched", tx);
        let (orphan_tx, _orphan_rx) = mpsc::unbounded_channel();
        let orphan = registry.attach("orphan", orphan_tx);
        registry.detach("orphan", orphan);

        // Nothing is stale yet
        assert!(registry.prune(Duration::from_secs(60), |_| false).is_empty());

        let mut pruned = registry.prune(Duration::ZERO, |id| id == "live");
        pruned.sort();
        assert_eq!(pruned, vec!["ended", "orphan"]);
        assert!(registry.contains("live"));
        assert!(registry.contains("watched"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_publish_without_session_reaches_nobody() {
        let registry = SessionRegistry::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach("s1", tx);

        registry.publish(&BridgeEvent::Retry {
            kind: bridge_proto::ErrorKind::Backend,
            attempt: 1,
            delay_ms: 10,
            session_id: None,
        });

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_publish_routes_by_session() {
        let registry = SessionRegistry::new(10);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.attach("s1", tx1);
        registry.attach("s2", tx2);

        registry.publish(&BridgeEvent::Retry {
            kind: bridge_proto::ErrorKind::Timeout,
            attempt: 1,
            delay_ms: 1000,
            session_id: Some("s2".to_string()),
        });

        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
