//! Live-message reconstruction for streamed tasks.
//!
//! One logical Telegram message per task: the first token creates it, later
//! tokens edit it in place, and `done=true` (or the `OutgoingReply` final
//! sync — whichever arrives first) finalizes it. Tokens are applied in
//! sequence order; late tokens are dropped. Edits are rate-capped so the
//! platform limit is respected; buffered text is flushed by the next edit
//! or by finalization.
//!
//! The tracker is pure state — the adapter applies the returned actions
//! with actual Telegram calls and reports message ids back.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::format::clamp_live;

/// Minimum spacing between live edits of one message.
pub const MIN_EDIT_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix the adapter appends when the model stream was cut mid-answer.
pub const INTERRUPTED_SUFFIX: &str = " (connection interrupted)";

/// Localized text shown when the stream reports data loss.
pub const INTERNAL_ERROR_TEXT: &str = "Something went wrong on our side. Please try again.";

#[derive(Debug, PartialEq)]
pub enum StreamAction {
    /// No visible change (buffered, late, or unknown task).
    None,
    /// Create the live message with this text; report the platform message
    /// id back via [`StreamTracker::attach_message`].
    Start { text: String },
    /// Edit the live message in place.
    Edit { message_id: i32, text: String },
    /// Last edit for this task; the tracker entry is gone afterwards.
    Finalize { message_id: Option<i32>, text: String },
}

/// A live message orphaned by bus data loss; the adapter replaces it with
/// the localized internal-error text.
#[derive(Debug, PartialEq)]
pub struct GapFinalize {
    pub chat_id: i64,
    pub message_id: Option<i32>,
}

struct LiveStream {
    chat_id: i64,
    buffer: String,
    message_id: Option<i32>,
    last_seq: u64,
    last_edit: Instant,
    rendered_len: usize,
    finalized: bool,
}

#[derive(Default)]
pub struct StreamTracker {
    tasks: DashMap<String, LiveStream>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `StreamToken`. `now` is injected so the edit cap is
    /// testable.
    pub fn on_token(
        &self,
        task_id: &str,
        chat_id: i64,
        seq: u64,
        token: &str,
        done: bool,
        interrupted: bool,
        now: Instant,
    ) -> StreamAction {
        let mut entry = self
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| LiveStream {
                chat_id,
                buffer: String::new(),
                message_id: None,
                last_seq: 0,
                last_edit: now.checked_sub(MIN_EDIT_INTERVAL).unwrap_or(now),
                rendered_len: 0,
                finalized: false,
            });

        // Sequence order, not arrival order: anything at or before the
        // high-water mark already happened.
        if seq <= entry.last_seq || entry.finalized {
            return StreamAction::None;
        }
        entry.last_seq = seq;
        entry.buffer.push_str(token);

        if done {
            entry.finalized = true;
            if interrupted {
                entry.buffer.push_str(INTERRUPTED_SUFFIX);
            }
            let text = clamp_live(&entry.buffer).to_string();
            return StreamAction::Finalize {
                message_id: entry.message_id,
                text,
            };
        }

        if entry.buffer.is_empty() {
            return StreamAction::None;
        }

        match entry.message_id {
            None => {
                // First visible content creates the live message.
                entry.last_edit = now;
                entry.rendered_len = entry.buffer.len();
                StreamAction::Start {
                    text: clamp_live(&entry.buffer).to_string(),
                }
            }
            Some(message_id) => {
                if now.duration_since(entry.last_edit) < MIN_EDIT_INTERVAL
                    || entry.rendered_len == entry.buffer.len()
                {
                    return StreamAction::None;
                }
                entry.last_edit = now;
                entry.rendered_len = entry.buffer.len();
                StreamAction::Edit {
                    message_id,
                    text: clamp_live(&entry.buffer).to_string(),
                }
            }
        }
    }

    /// Record the platform message id created for a task's live message.
    pub fn attach_message(&self, task_id: &str, message_id: i32) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.message_id = Some(message_id);
        }
    }

    /// Apply the `OutgoingReply` final sync. Whichever of done-token and
    /// reply arrives first wins; the other becomes a no-op when the text is
    /// unchanged.
    pub fn on_final_reply(&self, task_id: &str, text: &str) -> StreamAction {
        match self.tasks.remove(task_id) {
            None => StreamAction::Finalize {
                message_id: None,
                text: text.to_string(),
            },
            Some((_, entry)) => {
                if entry.finalized && entry.buffer == text {
                    return StreamAction::None;
                }
                StreamAction::Finalize {
                    message_id: entry.message_id,
                    text: text.to_string(),
                }
            }
        }
    }

    /// Bus-level data loss: every live message is abandoned and handed back
    /// for an internal-error edit. (The adapter cannot write task records,
    /// so the record itself is failed by its owner.)
    pub fn on_gap(&self) -> Vec<GapFinalize> {
        let task_ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut orphans = Vec::new();
        for task_id in task_ids {
            if let Some((_, entry)) = self.tasks.remove(&task_id) {
                orphans.push(GapFinalize {
                    chat_id: entry.chat_id,
                    message_id: entry.message_id,
                });
            }
        }
        orphans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn first_token_starts_live_message() {
        let tracker = StreamTracker::new();
        let action = tracker.on_token("t1", 1, 1, "he", false, false, t0());
        assert_eq!(
            action,
            StreamAction::Start {
                text: "he".to_string()
            }
        );
    }

    #[test]
    fn tokens_within_rate_cap_are_buffered_then_flushed() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "he", false, false, start);
        tracker.attach_message("t1", 99);

        // Inside the cap: buffered, no edit.
        let action = tracker.on_token("t1", 1, 2, "l", false, false, start + Duration::from_millis(50));
        assert_eq!(action, StreamAction::None);

        // Past the cap: one edit carrying everything buffered so far.
        let action =
            tracker.on_token("t1", 1, 3, "lo", false, false, start + Duration::from_millis(300));
        assert_eq!(
            action,
            StreamAction::Edit {
                message_id: 99,
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn late_tokens_are_dropped() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 2, "world", false, false, start);
        tracker.attach_message("t1", 99);

        let action = tracker.on_token("t1", 1, 1, "hello ", false, false, start + Duration::from_secs(1));
        assert_eq!(action, StreamAction::None);
    }

    #[test]
    fn done_token_finalizes_ignoring_rate_cap() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "hi", false, false, start);
        tracker.attach_message("t1", 7);

        let action = tracker.on_token("t1", 1, 2, "", true, false, start + Duration::from_millis(1));
        assert_eq!(
            action,
            StreamAction::Finalize {
                message_id: Some(7),
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn interrupted_done_appends_suffix() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "partial", false, false, start);
        tracker.attach_message("t1", 7);

        let StreamAction::Finalize { text, .. } =
            tracker.on_token("t1", 1, 2, "", true, true, start + Duration::from_secs(1))
        else {
            panic!("expected finalize");
        };
        assert_eq!(text, format!("partial{INTERRUPTED_SUFFIX}"));
    }

    #[test]
    fn reply_after_done_with_same_text_is_noop() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "hello", false, false, start);
        tracker.attach_message("t1", 7);
        tracker.on_token("t1", 1, 2, "", true, false, start + Duration::from_secs(1));

        // Idempotent final sync.
        assert_eq!(tracker.on_final_reply("t1", "hello"), StreamAction::None);
        // And the entry is gone.
        assert_eq!(
            tracker.on_final_reply("t1", "hello"),
            StreamAction::Finalize {
                message_id: None,
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn reply_with_different_text_supersedes_stream() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "draft", false, false, start);
        tracker.attach_message("t1", 7);

        let action = tracker.on_final_reply("t1", "final answer");
        assert_eq!(
            action,
            StreamAction::Finalize {
                message_id: Some(7),
                text: "final answer".to_string()
            }
        );
    }

    #[test]
    fn tokens_after_finalize_are_ignored() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("t1", 1, 1, "hi", false, false, start);
        tracker.on_token("t1", 1, 2, "", true, false, start);

        let action = tracker.on_token("t1", 1, 3, "late", false, false, start + Duration::from_secs(1));
        assert_eq!(action, StreamAction::None);
    }

    #[test]
    fn gap_abandons_all_live_messages() {
        let tracker = StreamTracker::new();
        let start = t0();
        tracker.on_token("a", 5, 1, "x", false, false, start);
        tracker.attach_message("a", 10);
        tracker.on_token("b", 6, 1, "y", false, false, start);

        let mut orphans = tracker.on_gap();
        orphans.sort_by_key(|o| o.chat_id);
        assert_eq!(
            orphans,
            vec![
                GapFinalize {
                    chat_id: 5,
                    message_id: Some(10)
                },
                GapFinalize {
                    chat_id: 6,
                    message_id: None
                },
            ]
        );
        assert!(tracker.on_gap().is_empty());
    }
}
