// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio::sync::OwnedMutexGuard;

use crate::rpc::{Notification, NotificationStream};

/// Handle for one in-flight turn: a finite sequence of notifications ending
/// on `turn.completed`/`turn.failed`.
///
/// Holds the session's turn lock; dropping the handle (completion, timeout,
/// or client disconnect) releases the lock and unsubscribes exactly once,
/// by ownership.
pub struct TurnHandle {
    thread_id: String,
    stream: NotificationStream,
    _gate: OwnedMutexGuard<()>,
    done: bool,
    terminal_seen: bool,
}

impl TurnHandle {
    pub(super) fn new(
        thread_id: String,
        stream: NotificationStream,
        gate: OwnedMutexGuard<()>,
    ) -> Self {
        Self { thread_id, stream, _gate: gate, done: false, terminal_seen: false }
    }

    /// The conversation this turn belongs to.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Next notification for this turn.
    ///
    /// Returns the terminal notification as the final element, then `None`.
    /// Also returns `None` early if the transport dies mid-turn; callers
    /// distinguish that case by checking [`TurnHandle::saw_terminal`].
    pub async fn next_event(&mut self) -> Option<Notification> {
        if self.done {
            return None;
        }
        match self.stream.recv().await {
            Some(note) => {
                if note.is_terminal() {
                    self.done = true;
                    self.terminal_seen = true;
                }
                Some(note)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Whether a terminal notification has been observed.
    pub fn saw_terminal(&self) -> bool {
        self.terminal_seen
    }
}
