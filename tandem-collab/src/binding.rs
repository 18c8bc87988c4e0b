//! Editor binding: keeps an editor widget and a replica in step.
//!
//! ```text
//! widget edit ──► capture() ──► forward() ──► EditSink (Doc / Session)
//!                   │
//!                   └── None while a remote diff is being applied
//!
//! RemoteChange ──► apply_remote(widget, changes) ──► widget range edits
//!                        (cursor shifted, guard held)
//! ```
//!
//! Edits the binding itself writes into the widget come back as change
//! notifications; the "applying remote" flag makes `capture` drop them so
//! they are not sent back out as local edits.

use std::cell::Cell;

use tandem_core::{Doc, EngineError, TextChange};

use crate::awareness::{ParticipantId, Presence};
use crate::session::Session;

/// Text buffer consumed by the binding. Offsets are in characters.
pub trait EditorWidget {
    fn len(&self) -> usize;
    fn insert(&mut self, index: usize, text: &str);
    fn delete(&mut self, index: usize, len: usize);
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, index: usize);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where local edits go.
pub trait EditSink {
    fn insert(&mut self, position: usize, text: &str) -> Result<(), EngineError>;
    fn delete(&mut self, position: usize, length: usize) -> Result<(), EngineError>;
    fn set_local_presence(&mut self, state: Vec<u8>);
}

impl EditSink for Session {
    fn insert(&mut self, position: usize, text: &str) -> Result<(), EngineError> {
        Session::insert(self, position, text)
    }

    fn delete(&mut self, position: usize, length: usize) -> Result<(), EngineError> {
        Session::delete(self, position, length)
    }

    fn set_local_presence(&mut self, state: Vec<u8>) {
        Session::set_local_presence(self, state)
    }
}

/// A bare replica has no presence channel; presence updates are dropped.
impl EditSink for Doc {
    fn insert(&mut self, position: usize, text: &str) -> Result<(), EngineError> {
        Doc::insert(self, position, text).map(|_| ())
    }

    fn delete(&mut self, position: usize, length: usize) -> Result<(), EngineError> {
        Doc::delete(self, position, length).map(|_| ())
    }

    fn set_local_presence(&mut self, _state: Vec<u8>) {}
}

/// A change reported by the editor widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

/// Binding between one widget and one replica.
pub struct EditorBinding {
    participant: ParticipantId,
    name: String,
    applying_remote: Cell<bool>,
}

/// Clears the "applying remote" flag when dropped, on every exit path.
struct RemoteGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> RemoteGuard<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for RemoteGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl EditorBinding {
    pub fn new(participant: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            participant,
            name: name.into(),
            applying_remote: Cell::new(false),
        }
    }

    /// Whether a remote diff is being written into the widget right now.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.get()
    }

    /// Write remote changes into the widget, keeping the local cursor on
    /// the character it was on.
    pub fn apply_remote<W: EditorWidget + ?Sized>(&self, widget: &mut W, changes: &[TextChange]) {
        let _guard = RemoteGuard::new(&self.applying_remote);
        for change in changes {
            let cursor = widget.cursor();
            match change {
                TextChange::Insert { index, text } => {
                    let index = (*index).min(widget.len());
                    widget.insert(index, text);
                    if index < cursor {
                        widget.set_cursor(cursor + text.chars().count());
                    } else {
                        widget.set_cursor(cursor);
                    }
                }
                TextChange::Delete { index, len } => {
                    let index = (*index).min(widget.len());
                    let len = (*len).min(widget.len() - index);
                    widget.delete(index, len);
                    let new_cursor = if cursor <= index {
                        cursor
                    } else if cursor >= index + len {
                        cursor - len
                    } else {
                        index
                    };
                    widget.set_cursor(new_cursor);
                }
            }
        }
    }

    /// Filter a widget change notification. `None` for echoes of remote
    /// edits.
    pub fn capture(&self, edit: WidgetEdit) -> Option<WidgetEdit> {
        if self.applying_remote.get() {
            return None;
        }
        Some(edit)
    }

    /// Forward a captured local edit to the replica.
    pub fn forward<S: EditSink + ?Sized>(&self, edit: &WidgetEdit, sink: &mut S) -> Result<(), EngineError> {
        match edit {
            WidgetEdit::Insert { index, text } => sink.insert(*index, text),
            WidgetEdit::Delete { index, len } => sink.delete(*index, *len),
        }
    }

    /// Publish the local selection as presence.
    pub fn selection_changed<S: EditSink + ?Sized>(&self, anchor: usize, head: usize, sink: &mut S) {
        let presence = Presence::new(self.participant, self.name.clone()).with_selection(anchor, head);
        match presence.encode() {
            Ok(blob) => sink.set_local_presence(blob),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::session::SessionConfig;

    /// Widget backed by a char vector that records its notifications.
    #[derive(Default)]
    struct FakeWidget {
        text: Vec<char>,
        cursor: usize,
        notifications: Vec<WidgetEdit>,
    }

    impl FakeWidget {
        fn text(&self) -> String {
            self.text.iter().collect()
        }
    }

    impl EditorWidget for FakeWidget {
        fn len(&self) -> usize {
            self.text.len()
        }

        fn insert(&mut self, index: usize, text: &str) {
            for (offset, ch) in text.chars().enumerate() {
                self.text.insert(index + offset, ch);
            }
            self.notifications.push(WidgetEdit::Insert { index, text: text.to_string() });
        }

        fn delete(&mut self, index: usize, len: usize) {
            self.text.drain(index..index + len);
            self.notifications.push(WidgetEdit::Delete { index, len });
        }

        fn cursor(&self) -> usize {
            self.cursor
        }

        fn set_cursor(&mut self, index: usize) {
            self.cursor = index.min(self.text.len());
        }
    }

    fn widget(text: &str, cursor: usize) -> FakeWidget {
        FakeWidget { text: text.chars().collect(), cursor, notifications: Vec::new() }
    }

    #[test]
    fn test_insert_before_cursor_shifts_it() {
        let binding = EditorBinding::new(1, "Ada");
        let mut w = widget("hello", 3);
        binding.apply_remote(&mut w, &[TextChange::Insert { index: 1, text: "XY".into() }]);
        assert_eq!(w.text(), "hXYello");
        assert_eq!(w.cursor(), 5);
    }

    #[test]
    fn test_insert_at_or_after_cursor_keeps_it() {
        let binding = EditorBinding::new(1, "Ada");
        let mut w = widget("hello", 3);
        binding.apply_remote(&mut w, &[TextChange::Insert { index: 3, text: "__".into() }]);
        assert_eq!(w.cursor(), 3);
        binding.apply_remote(&mut w, &[TextChange::Insert { index: 6, text: "!".into() }]);
        assert_eq!(w.cursor(), 3);
    }

    #[test]
    fn test_delete_around_cursor() {
        let binding = EditorBinding::new(1, "Ada");

        let mut w = widget("abcdefgh", 6);
        binding.apply_remote(&mut w, &[TextChange::Delete { index: 1, len: 2 }]);
        assert_eq!(w.cursor(), 4);

        // Spanning the cursor collapses it to the deletion start
        let mut w = widget("abcdefgh", 4);
        binding.apply_remote(&mut w, &[TextChange::Delete { index: 2, len: 4 }]);
        assert_eq!(w.text(), "abgh");
        assert_eq!(w.cursor(), 2);

        let mut w = widget("abcdefgh", 2);
        binding.apply_remote(&mut w, &[TextChange::Delete { index: 5, len: 2 }]);
        assert_eq!(w.cursor(), 2);
    }

    #[test]
    fn test_remote_edits_are_not_echoed() {
        let binding = EditorBinding::new(1, "Ada");
        let mut w = widget("", 0);

        // A widget reports changes synchronously while the guard is held
        struct Echoing<'a> {
            inner: FakeWidget,
            binding: &'a EditorBinding,
            captured: Vec<Option<WidgetEdit>>,
        }
        impl EditorWidget for Echoing<'_> {
            fn len(&self) -> usize {
                self.inner.len()
            }
            fn insert(&mut self, index: usize, text: &str) {
                self.inner.insert(index, text);
                let edit = WidgetEdit::Insert { index, text: text.to_string() };
                self.captured.push(self.binding.capture(edit));
            }
            fn delete(&mut self, index: usize, len: usize) {
                self.inner.delete(index, len);
                self.captured.push(self.binding.capture(WidgetEdit::Delete { index, len }));
            }
            fn cursor(&self) -> usize {
                self.inner.cursor()
            }
            fn set_cursor(&mut self, index: usize) {
                self.inner.set_cursor(index)
            }
        }

        let mut echoing = Echoing { inner: std::mem::take(&mut w), binding: &binding, captured: Vec::new() };
        binding.apply_remote(&mut echoing, &[TextChange::Insert { index: 0, text: "hi".into() }]);
        assert_eq!(echoing.captured, vec![None]);
        assert!(!binding.is_applying_remote());

        let local = WidgetEdit::Insert { index: 2, text: "!".into() };
        assert_eq!(binding.capture(local.clone()), Some(local));
    }

    #[test]
    fn test_forward_to_doc_and_bounds_errors() {
        let binding = EditorBinding::new(1, "Ada");
        let mut doc = Doc::new(1);
        binding.forward(&WidgetEdit::Insert { index: 0, text: "abc".into() }, &mut doc).unwrap();
        binding.forward(&WidgetEdit::Delete { index: 1, len: 1 }, &mut doc).unwrap();
        assert_eq!(doc.text(), "ac");
        assert!(binding.forward(&WidgetEdit::Delete { index: 1, len: 5 }, &mut doc).is_err());
    }

    #[test]
    fn test_two_widgets_converge_through_docs() {
        let a_binding = EditorBinding::new(1, "Ada");
        let b_binding = EditorBinding::new(2, "Bob");
        let mut a_doc = Doc::new(1);
        let mut b_doc = Doc::new(2);
        let mut a_widget = widget("", 0);
        let mut b_widget = widget("", 0);

        a_widget.insert(0, "hello");
        let edit = a_binding.capture(a_widget.notifications.remove(0)).unwrap();
        a_binding.forward(&edit, &mut a_doc).unwrap();

        let changes = b_doc.merge(&a_doc.encode_state_as_update());
        b_binding.apply_remote(&mut b_widget, &changes);
        assert_eq!(b_widget.text(), "hello");
        assert_eq!(b_widget.text(), b_doc.text());
    }

    #[test]
    fn test_selection_changed_publishes_presence() {
        let binding = EditorBinding::new(1, "Ada");
        let mut session = Session::new(Doc::new(1), SessionConfig::default(), Instant::now());
        binding.selection_changed(2, 5, &mut session);

        let blob = session.awareness().local_state().unwrap().to_vec();
        let presence = Presence::decode(&blob).unwrap();
        assert_eq!(presence.name, "Ada");
        assert_eq!(presence.selection.map(|s| (s.anchor, s.head)), Some((2, 5)));
    }
}
