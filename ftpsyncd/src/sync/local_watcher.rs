use std::collections::HashMap;
use std::path::{Component, Path};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use super::paths::is_hidden;

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A change to one file, by path relative to the local root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: String,
    pub kind: ChangeKind,
}

impl LocalEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Watches `root` recursively. Only changes after this call are reported.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let kind = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to, ..] = event.paths.as_slice() {
                return [
                    relative_path(root, from).map(|p| LocalEvent::new(p, ChangeKind::Deleted)),
                    relative_path(root, to).map(|p| LocalEvent::new(p, ChangeKind::Created)),
                ]
                .into_iter()
                .flatten()
                .collect();
            }
            return Vec::new();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Create(CreateKind::Folder) => return Vec::new(),
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(RemoveKind::Folder) => return Vec::new(),
        EventKind::Remove(_) => ChangeKind::Deleted,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter_map(|path| relative_path(root, path))
        .map(|path| LocalEvent::new(path, kind))
        .collect()
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    let joined = parts.join("/");
    if joined.is_empty() || is_hidden(&joined) {
        None
    } else {
        Some(joined)
    }
}

fn merge(previous: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (previous, next) {
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        (ChangeKind::Created, _) => ChangeKind::Created,
        (ChangeKind::Deleted, _) => ChangeKind::Modified,
        (ChangeKind::Modified, _) => ChangeKind::Modified,
    }
}

/// Collapses bursts of events per path into one settled event.
///
/// Each path has one timer in a `DelayQueue`; a new event for the path
/// resets it and merges the change kind.
pub struct Debouncer {
    window: Duration,
    queue: DelayQueue<String>,
    pending: HashMap<String, (Key, ChangeKind)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, event: LocalEvent) {
        match self.pending.get_mut(&event.path) {
            Some((key, kind)) => {
                self.queue.reset(key, self.window);
                *kind = merge(*kind, event.kind);
            }
            None => {
                let key = self.queue.insert(event.path.clone(), self.window);
                self.pending.insert(event.path, (key, event.kind));
            }
        }
    }

    /// Next settled event; `None` when nothing is pending.
    pub async fn next_settled(&mut self) -> Option<LocalEvent> {
        loop {
            let expired = std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
            let path = expired.into_inner();
            if let Some((_, kind)) = self.pending.remove(&path) {
                return Some(LocalEvent { path, kind });
            }
        }
    }

    /// Feeds `input` through the debounce window into `output` until cancelled
    /// or until the input closes and everything pending has been emitted.
    pub async fn run(
        mut self,
        mut input: mpsc::UnboundedReceiver<LocalEvent>,
        output: mpsc::UnboundedSender<LocalEvent>,
        cancel: CancellationToken,
    ) {
        let mut input_open = true;
        loop {
            if !input_open && self.pending.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = input.recv(), if input_open => match event {
                    Some(event) => self.push(event),
                    None => input_open = false,
                },
                Some(settled) = self.next_settled(), if !self.pending.is_empty() => {
                    tracing::trace!(path = %settled.path, kind = ?settled.kind, "change settled");
                    if output.send(settled).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::time::Instant;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_modify_event_to_modified() {
        let mapped = map_event(
            Path::new("/tmp/root"),
            event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
                &["/tmp/root/Docs/A.txt"],
            ),
        );
        assert_eq!(mapped, vec![LocalEvent::new("Docs/A.txt", ChangeKind::Modified)]);
    }

    #[test]
    fn maps_rename_to_delete_and_create() {
        let mapped = map_event(
            Path::new("/tmp/root"),
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/root/Docs/A.txt", "/tmp/root/Docs/B.txt"],
            ),
        );
        assert_eq!(
            mapped,
            vec![
                LocalEvent::new("Docs/A.txt", ChangeKind::Deleted),
                LocalEvent::new("Docs/B.txt", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn drops_hidden_outside_and_directory_events() {
        let root = Path::new("/tmp/root");
        let create = EventKind::Create(CreateKind::File);
        assert!(map_event(root, event(create, &["/tmp/root/.git/index"])).is_empty());
        assert!(map_event(root, event(create, &["/tmp/root/.a.txt.ftpsync-partial"])).is_empty());
        assert!(map_event(root, event(create, &["/elsewhere/a.txt"])).is_empty());
        assert!(
            map_event(
                root,
                event(EventKind::Create(CreateKind::Folder), &["/tmp/root/new"])
            )
            .is_empty()
        );
    }

    #[test]
    fn merges_change_kinds() {
        use ChangeKind::*;
        assert_eq!(merge(Created, Modified), Created);
        assert_eq!(merge(Modified, Modified), Modified);
        assert_eq!(merge(Created, Deleted), Deleted);
        assert_eq!(merge(Modified, Deleted), Deleted);
        assert_eq!(merge(Deleted, Created), Modified);
    }

    fn spawn_debouncer(
        window: Duration,
    ) -> (
        mpsc::UnboundedSender<LocalEvent>,
        mpsc::UnboundedReceiver<LocalEvent>,
        CancellationToken,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(Debouncer::new(window).run(in_rx, out_tx, cancel.clone()));
        (in_tx, out_rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_modifications_settle_into_one_event() {
        let (tx, mut rx, _cancel) = spawn_debouncer(Duration::from_secs(2));
        let start = Instant::now();

        tx.send(LocalEvent::new("a.txt", ChangeKind::Modified)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(LocalEvent::new("a.txt", ChangeKind::Modified)).unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());

        let settled = rx.recv().await.unwrap();
        assert_eq!(settled, LocalEvent::new("a.txt", ChangeKind::Modified));
        assert!(start.elapsed() >= Duration::from_millis(3500));

        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn paths_settle_independently() {
        let (tx, mut rx, _cancel) = spawn_debouncer(Duration::from_secs(2));
        tx.send(LocalEvent::new("a.txt", ChangeKind::Created)).unwrap();
        tx.send(LocalEvent::new("b.txt", ChangeKind::Modified)).unwrap();
        tx.send(LocalEvent::new("a.txt", ChangeKind::Modified)).unwrap();
        tx.send(LocalEvent::new("b.txt", ChangeKind::Deleted)).unwrap();
        drop(tx);

        let mut settled = Vec::new();
        while let Some(event) = rx.recv().await {
            settled.push(event);
        }
        settled.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            settled,
            vec![
                LocalEvent::new("a.txt", ChangeKind::Created),
                LocalEvent::new("b.txt", ChangeKind::Deleted),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let (tx, mut rx, cancel) = spawn_debouncer(Duration::from_secs(2));
        tx.send(LocalEvent::new("a.txt", ChangeKind::Modified)).unwrap();
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
