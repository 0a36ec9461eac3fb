//! File records: one per descriptor a selection is interested in.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::mode::{Mode, MODE_COUNT};
use crate::selection::{Selection, SelectionInner};
use crate::Descriptor;

/// Callback invoked when a descriptor becomes ready in a given mode.
/// Receives the selection it fired from, the file record, and the
/// cookie supplied at attach time.
///
/// Wrapped in `Rc<RefCell<_>>` rather than a plain `Box` so that
/// `File::from_template` can share a callback across many records the
/// way spec.md's template-based initialisation shares a function
/// pointer, instead of requiring callbacks to be `Clone`.
pub type Action<C> = Rc<RefCell<dyn FnMut(&Selection<C>, &File<C>, C)>>;

pub(crate) struct FileInner<C> {
    pub(crate) selection: Option<Weak<RefCell<SelectionInner<C>>>>,
    pub(crate) fd: Option<Descriptor>,
    pub(crate) cookie: Option<C>,
    pub(crate) enabled: crate::mode::ModeMask,
    pub(crate) actions: [Option<Action<C>>; MODE_COUNT],
}

impl<C> FileInner<C> {
    fn fresh() -> Self {
        FileInner {
            selection: None,
            fd: None,
            cookie: None,
            enabled: crate::mode::ModeMask::empty(),
            actions: [None, None, None],
        }
    }
}

/// A descriptor record. Cheap to clone (an `Rc` handle); cloning two
/// `File`s refers to the same underlying record, exactly as holding
/// the same pointer twice would in the C original.
pub struct File<C> {
    pub(crate) inner: Rc<RefCell<FileInner<C>>>,
}

impl<C> Clone for File<C> {
    fn clone(&self) -> Self {
        File { inner: self.inner.clone() }
    }
}

impl<C: Copy> File<C> {
    /// A fresh, unattached record with no callbacks configured.
    pub fn new() -> Self {
        File { inner: Rc::new(RefCell::new(FileInner::fresh())) }
    }

    /// A fresh, unattached record whose action slots are copied from
    /// `template`. Mirrors spec.md's `file_init_new(f, template)`: a
    /// cheap way to spin up many records that share the same callbacks.
    pub fn from_template(template: &File<C>) -> Self {
        let t = template.inner.borrow();
        let mut inner = FileInner::fresh();
        inner.actions = [t.actions[0].clone(), t.actions[1].clone(), t.actions[2].clone()];
        drop(t);
        File { inner: Rc::new(RefCell::new(inner)) }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.borrow().selection.is_some()
    }

    pub fn fd(&self) -> Option<Descriptor> {
        self.inner.borrow().fd
    }

    pub fn cookie(&self) -> Option<C> {
        self.inner.borrow().cookie
    }

    pub fn enabled(&self) -> crate::mode::ModeMask {
        self.inner.borrow().enabled
    }

    /// Replaces the callback for `mode` without changing whether the
    /// mode is enabled. Fatal if `action` is `None` and the mode is
    /// currently enabled (there would be nothing left to call when it
    /// fires). A file-only operation, per spec.md's `set_action`;
    /// unlike `enable_mode` it needs no selection to check against.
    pub fn set_action(&self, mode: Mode, action: Option<Action<C>>) {
        let mut finner = self.inner.borrow_mut();
        if action.is_none() {
            assert!(!finner.enabled.contains(mode.bit()), "cannot clear the callback for an enabled mode");
        }
        finner.actions[mode.index()] = action;
    }

    /// Detach from whichever selection this file is currently attached
    /// to, if any. A no-op if the file is unattached.
    pub fn detach(&self) {
        let weak = self.inner.borrow().selection.clone();
        let weak = match weak {
            Some(w) => w,
            None => return,
        };
        match weak.upgrade() {
            Some(rc) => Selection::from_inner(rc).detach(self),
            None => self.inner.borrow_mut().selection = None,
        }
    }
}

impl<C: Copy> Default for File<C> {
    fn default() -> Self {
        File::new()
    }
}
