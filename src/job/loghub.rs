//! Per-job output fan-out.
//!
//! A [`LogHub`] owns the job's output history. Every [`Subscription`] keeps
//! its own cursor into that history and is woken through a `watch` channel
//! whenever lines are appended or the hub is closed. Replay and live delivery
//! are the same code path: a subscriber simply reads `history[cursor..]`, so
//! a late subscriber can never miss or repeat a line, no matter how
//! publishing races with it.
//!
//! Publishing never waits on subscribers. A slow subscriber only falls
//! further behind its own cursor; the retained history is the buffer.

use tokio::sync::watch;

#[derive(Debug, Default)]
struct HubState {
    lines: Vec<String>,
    closed: bool,
}

/// Append-only output history with any number of independent readers.
#[derive(Debug)]
pub struct LogHub {
    tx: watch::Sender<HubState>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HubState::default());
        Self { tx }
    }

    /// Append a line and wake all subscribers.
    ///
    /// Returns `false` (and records nothing) once the hub is closed.
    pub fn publish(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        self.tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.lines.push(line);
            true
        })
    }

    /// Freeze the history and signal end-of-stream to every subscriber.
    ///
    /// Returns `false` if the hub was already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.closed = true;
            true
        })
    }

    /// Append a final line and close in one step, so no other publisher can
    /// slip a line in after it.
    pub fn close_with(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        self.tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.lines.push(line);
            state.closed = true;
            true
        })
    }

    /// Attach a new reader positioned at the first line ever recorded.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            cursor: 0,
        }
    }

    /// Copy of everything recorded so far.
    pub fn history(&self) -> Vec<String> {
        self.tx.borrow().lines.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// Number of subscriptions currently alive.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One reader's view of a [`LogHub`]. Dropping it detaches the reader.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<HubState>,
    cursor: usize,
}

impl Subscription {
    /// Next line in production order, or `None` once the hub is closed and
    /// every recorded line has been delivered.
    ///
    /// Cancel safe: the cursor only moves when a line is returned.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            {
                // Marking the value seen before reading means any publish
                // after this point wakes the `changed()` below.
                let state = self.rx.borrow_and_update();
                if let Some(line) = state.lines.get(self.cursor) {
                    let line = line.clone();
                    drop(state);
                    self.cursor += 1;
                    return Some(line);
                }
                if state.closed {
                    return None;
                }
            }

            if self.rx.changed().await.is_err() {
                // Hub dropped without closing: drain what is left.
                let line = self.rx.borrow().lines.get(self.cursor).cloned();
                if line.is_some() {
                    self.cursor += 1;
                }
                return line;
            }
        }
    }

    /// Index of the next line this subscriber will receive.
    pub fn position(&self) -> usize {
        self.cursor
    }
}
