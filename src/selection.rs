//! The selection: the set of descriptors being watched, the wait
//! protocol against `libc::pselect`, and the resumable dispatch
//! protocol that walks ready descriptors back out to their callbacks.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::file::{Action, File};
use crate::mode::{self, Mode, ModeMask, ALL_MODES, MODE_COUNT};
use crate::probe::{self, DescriptorSet};
use crate::Descriptor;

/// A record is moved out of the ordered sparse list into a
/// directly-indexed dense array once this many records are attached.
/// Conversion is one-way: a selection never goes back to sparse
/// storage once it has gone dense, even if records are later removed.
const SPARSE_TO_DENSE_THRESHOLD: usize = 9;

enum Files<C> {
    Sparse(Vec<(Descriptor, File<C>)>),
    Dense(Vec<Option<File<C>>>),
}

/// Outcome of a call to [`Selection::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one descriptor is ready; `dispatch_next` may be called
    /// this many times before it reports nothing left pending.
    Ready(usize),
    /// The deadline passed with nothing ready.
    TimedOut,
    /// The wait was interrupted by a signal before the deadline.
    Interrupted,
}

pub(crate) struct SelectionInner<C> {
    files: Files<C>,
    fd_count: usize,
    fd_last: Descriptor,

    enabled: [DescriptorSet; MODE_COUNT],
    enabled_count: [usize; MODE_COUNT],

    results: [DescriptorSet; MODE_COUNT],
    tried_count: [usize; MODE_COUNT],
    tried_fd_last: Descriptor,

    pend_count: usize,
    pend_mode: Option<Mode>,
    pend_fd: Descriptor,

    signum: libc::c_int,
    sigmask: libc::sigset_t,
}

impl<C> SelectionInner<C> {
    fn fresh() -> Self {
        probe::tables();
        SelectionInner {
            files: Files::Sparse(Vec::new()),
            fd_count: 0,
            fd_last: 0,
            enabled: [DescriptorSet::empty(), DescriptorSet::empty(), DescriptorSet::empty()],
            enabled_count: [0; MODE_COUNT],
            results: [DescriptorSet::empty(), DescriptorSet::empty(), DescriptorSet::empty()],
            tried_count: [0; MODE_COUNT],
            tried_fd_last: 0,
            pend_count: 0,
            pend_mode: None,
            pend_fd: 0,
            signum: 0,
            sigmask: unsafe { std::mem::zeroed() },
        }
    }

    fn insert_file(&mut self, fd: Descriptor, file: File<C>) {
        match &mut self.files {
            Files::Sparse(v) => {
                match v.binary_search_by_key(&fd, |&(f, _)| f) {
                    Ok(_) => panic!("fd {} is already attached to this selection", fd),
                    Err(pos) => v.insert(pos, (fd, file)),
                }
                self.fd_count += 1;
                if fd > self.fd_last {
                    self.fd_last = fd;
                }
                if self.fd_count > SPARSE_TO_DENSE_THRESHOLD {
                    self.convert_to_dense();
                }
            }
            Files::Dense(v) => {
                let idx = fd as usize;
                if idx >= v.len() {
                    v.resize_with(idx + 1, || None);
                }
                assert!(v[idx].is_none(), "fd {} is already attached to this selection", fd);
                v[idx] = Some(file);
                self.fd_count += 1;
                if fd > self.fd_last {
                    self.fd_last = fd;
                }
            }
        }
    }

    fn convert_to_dense(&mut self) {
        let old = match &mut self.files {
            Files::Sparse(v) => std::mem::take(v),
            Files::Dense(_) => return,
        };
        let mut dense = Vec::new();
        for (fd, file) in old {
            let idx = fd as usize;
            if idx >= dense.len() {
                dense.resize_with(idx + 1, || None);
            }
            dense[idx] = Some(file);
        }
        log::trace!("selection converted from sparse to dense storage at {} files", self.fd_count);
        self.files = Files::Dense(dense);
    }

    fn get(&self, fd: Descriptor) -> Option<File<C>> {
        match &self.files {
            Files::Sparse(v) => v
                .binary_search_by_key(&fd, |&(f, _)| f)
                .ok()
                .map(|i| v[i].1.clone()),
            Files::Dense(v) => v.get(fd as usize).and_then(|o| o.clone()),
        }
    }

    fn recompute_fd_last(&self) -> Descriptor {
        match &self.files {
            Files::Sparse(v) => v.last().map(|&(fd, _)| fd).unwrap_or(0),
            Files::Dense(v) => v
                .iter()
                .rposition(|o| o.is_some())
                .map(|i| i as Descriptor)
                .unwrap_or(0),
        }
    }

    fn remove_file_at(&mut self, fd: Descriptor) -> Option<File<C>> {
        let removed = match &mut self.files {
            Files::Sparse(v) => v
                .binary_search_by_key(&fd, |&(f, _)| f)
                .ok()
                .map(|i| v.remove(i).1),
            Files::Dense(v) => {
                let idx = fd as usize;
                if idx < v.len() {
                    v[idx].take()
                } else {
                    None
                }
            }
        };
        if removed.is_some() {
            self.fd_count -= 1;
            self.fd_last = self.recompute_fd_last();
        }
        removed
    }

    /// Pops one arbitrary record out of storage (spec.md's "pop-last"
    /// vector idiom), compacting trailing empty dense slots.
    fn pop_any(&mut self) -> Option<File<C>> {
        let popped = match &mut self.files {
            Files::Sparse(v) => v.pop().map(|(_, f)| f),
            Files::Dense(v) => loop {
                match v.pop() {
                    None => break None,
                    Some(Some(f)) => break Some(f),
                    Some(None) => continue,
                }
            },
        };
        if popped.is_some() {
            self.fd_count -= 1;
            self.fd_last = self.recompute_fd_last();
        }
        popped
    }

    fn advance_cursor(&mut self) -> (Descriptor, Mode) {
        let mut mode = self.pend_mode.expect("dispatch invoked with nothing armed");
        let mut fd = self.pend_fd;
        loop {
            match probe::scan_next(&mut self.results[mode.index()], fd, self.tried_fd_last) {
                Some(found) => return (found, mode),
                None => {
                    loop {
                        self.tried_count[mode.index()] = 0;
                        mode = mode.next().expect("ran out of pending modes before pend_count reached zero");
                        if self.tried_count[mode.index()] != 0 {
                            break;
                        }
                    }
                    self.pend_mode = Some(mode);
                    fd = 0;
                }
            }
        }
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        let entries: Vec<(Descriptor, File<C>)> = match &self.files {
            Files::Sparse(v) => v.clone(),
            Files::Dense(v) => v
                .iter()
                .enumerate()
                .filter_map(|(i, o)| o.clone().map(|f| (i as Descriptor, f)))
                .collect(),
        };

        let mut n = 0usize;
        let mut last_fd: Option<Descriptor> = None;
        let mut recomputed_count = [0usize; MODE_COUNT];
        let mut recomputed_enabled = [DescriptorSet::empty(), DescriptorSet::empty(), DescriptorSet::empty()];

        for (fd, file) in &entries {
            n += 1;
            if let Files::Sparse(_) = &self.files {
                debug_assert!(last_fd.is_none_or(|last| *fd > last), "files not stored in ascending fd order");
            }
            last_fd = Some(*fd);

            let finner = file.inner.borrow();
            debug_assert_eq!(finner.fd, Some(*fd), "file's own fd disagrees with its storage slot");

            for mode in ALL_MODES {
                if finner.enabled.contains(mode.bit()) {
                    recomputed_count[mode.index()] += 1;
                    recomputed_enabled[mode.index()].set(*fd);
                }
            }
        }

        debug_assert_eq!(n, self.fd_count, "fd_count does not tally with the files stored");
        debug_assert_eq!(last_fd.unwrap_or(0), self.fd_last, "fd_last does not tally with the files stored");

        for mode in ALL_MODES {
            debug_assert_eq!(
                recomputed_count[mode.index()],
                self.enabled_count[mode.index()],
                "enabled count does not tally for mode {:?}",
                mode
            );
            debug_assert!(
                probe::sets_equal(&recomputed_enabled[mode.index()], &self.enabled[mode.index()]),
                "enabled bit vector does not tally for mode {:?}",
                mode
            );
        }

        if self.pend_count == 0 {
            debug_assert_eq!(
                probe::count_set_bits(&self.results),
                0,
                "nothing pending but results bit vectors are not empty"
            );
            return;
        }

        let pend_mode = self.pend_mode.expect("pend_count > 0 implies a pending mode");
        debug_assert!(self.pend_fd >= 0 && self.pend_fd <= self.tried_fd_last);

        for mode in ALL_MODES {
            if mode < pend_mode {
                debug_assert_eq!(self.tried_count[mode.index()], 0, "mode before pend_mode still has a tried count");
            }
        }
        debug_assert!(self.tried_count[pend_mode.index()] > 0, "pend_mode has a zero tried count");

        for mode in ALL_MODES {
            if self.tried_count[mode.index()] == 0 {
                debug_assert_eq!(
                    probe::count_set_bits(std::slice::from_ref(&self.results[mode.index()])),
                    0,
                    "mode with zero tried count still has result bits"
                );
            }
        }

        let mut total = 0usize;
        for mode in ALL_MODES {
            if self.tried_count[mode.index()] == 0 {
                continue;
            }
            for fd in 0..=self.tried_fd_last {
                if self.results[mode.index()].is_set(fd) {
                    total += 1;
                    if mode == pend_mode {
                        debug_assert!(fd >= self.pend_fd, "pending result below the dispatch cursor");
                    }
                }
            }
        }
        debug_assert_eq!(total, self.pend_count, "pend_count does not tally with result bit vectors");
    }
}

/// The set of descriptors being watched and their wait state.
///
/// Cloning a `Selection` clones the handle (an `Rc`), not the
/// selection itself — all clones observe and mutate the same
/// underlying state, the way the teacher's `Reactor` handles share one
/// `Inner`.
pub struct Selection<C> {
    pub(crate) inner: Rc<RefCell<SelectionInner<C>>>,
}

impl<C> Clone for Selection<C> {
    fn clone(&self) -> Self {
        Selection { inner: self.inner.clone() }
    }
}

impl<C: Copy> Default for Selection<C> {
    fn default() -> Self {
        Selection::new()
    }
}

fn owns<C>(sel: &Rc<RefCell<SelectionInner<C>>>, file: &File<C>) -> bool {
    match &file.inner.borrow().selection {
        Some(w) => w.upgrade().is_some_and(|rc| Rc::ptr_eq(&rc, sel)),
        None => false,
    }
}

impl<C: Copy> Selection<C> {
    pub fn new() -> Self {
        Selection { inner: Rc::new(RefCell::new(SelectionInner::fresh())) }
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<SelectionInner<C>>>) -> Self {
        Selection { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().fd_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches `file` to this selection under `fd`, with `cookie`
    /// supplied to every future callback invocation. Fatal if `file`
    /// is already attached anywhere.
    pub fn attach(&self, file: &File<C>, fd: Descriptor, cookie: C) {
        assert!((fd as usize) < crate::MAX_FD, "fd {} is out of range", fd);
        {
            let mut finner = file.inner.borrow_mut();
            assert!(finner.selection.is_none(), "file is already attached to a selection");
            finner.selection = Some(Rc::downgrade(&self.inner));
            finner.fd = Some(fd);
            finner.cookie = Some(cookie);
            finner.enabled = ModeMask::empty();
        }
        self.inner.borrow_mut().insert_file(fd, file.clone());
    }

    /// Detaches `file` from this selection. No-op if `file` is not
    /// currently attached to `self`.
    pub fn detach(&self, file: &File<C>) {
        if !owns(&self.inner, file) {
            return;
        }
        self.disable_modes(file, ModeMask::all());
        let fd = file.inner.borrow().fd.expect("attached file has an fd");
        self.inner.borrow_mut().remove_file_at(fd);
        file.inner.borrow_mut().selection = None;
    }

    /// Detaches and returns one arbitrary attached file, or `None` if
    /// the selection is already empty. If `free_structure` is `false`
    /// and the selection was already empty, the selection's internal
    /// state is reinitialised as if freshly constructed.
    pub fn ream(&self, free_structure: bool) -> Option<File<C>> {
        let popped = self.inner.borrow_mut().pop_any();
        match popped {
            Some(file) => {
                self.disable_modes(&file, ModeMask::all());
                file.inner.borrow_mut().selection = None;
                Some(file)
            }
            None => {
                if !free_structure {
                    *self.inner.borrow_mut() = SelectionInner::fresh();
                }
                None
            }
        }
    }

    /// Enables `mode` on `file`. `action` replaces the callback for
    /// that mode if given; otherwise a callback must already be set.
    /// Fatal if `file` is not attached to this selection.
    pub fn enable_mode(&self, file: &File<C>, mode: Mode, action: Option<Action<C>>) {
        assert!(owns(&self.inner, file), "file is not attached to this selection");
        let (fd, newly_enabled) = {
            let mut finner = file.inner.borrow_mut();
            if let Some(a) = action {
                finner.actions[mode.index()] = Some(a);
            } else {
                assert!(finner.actions[mode.index()].is_some(), "enabling {:?} with no callback set", mode);
            }
            let fd = finner.fd.expect("attached file has an fd");
            let already = finner.enabled.contains(mode.bit());
            if !already {
                finner.enabled |= mode.bit();
            }
            (fd, !already)
        };
        if newly_enabled {
            let mut sel = self.inner.borrow_mut();
            sel.enabled[mode.index()].set(fd);
            sel.enabled_count[mode.index()] += 1;
        }
    }

    /// Disables every mode in `mask` on `file`, scrubbing any live
    /// result bits for those modes so a pending wait's results stay
    /// consistent with what is still enabled.
    pub fn disable_modes(&self, file: &File<C>, mask: ModeMask) {
        let fd = match file.inner.borrow().fd {
            Some(fd) => fd,
            None => return,
        };

        let mut remaining = {
            let mut finner = file.inner.borrow_mut();
            let to_clear = mask & finner.enabled;
            finner.enabled &= !to_clear;
            to_clear
        };

        let mut sel = self.inner.borrow_mut();
        while !remaining.is_empty() {
            let m = mode::any_mode_in(remaining);
            debug_assert!(sel.enabled_count[m.index()] > 0);
            debug_assert!(sel.enabled[m.index()].is_set(fd));
            sel.enabled[m.index()].clear(fd);
            sel.enabled_count[m.index()] -= 1;

            if sel.pend_count != 0 && sel.tried_count[m.index()] != 0 && sel.results[m.index()].is_set(fd) {
                sel.results[m.index()].clear(fd);
                sel.pend_count -= 1;
            }

            remaining &= !m.bit();
        }
    }

    /// Configures the signal this selection's wait unblocks for, or
    /// disables signal handling if `signum` is `0`. `mask` must have
    /// `signum` as a member; it is cleared from the mask that gets
    /// installed during the wait (the whole point is to unblock that
    /// one signal for the duration of the syscall).
    pub fn set_signal(&self, signum: libc::c_int, mask: libc::sigset_t) {
        let mut sel = self.inner.borrow_mut();
        if signum == 0 {
            sel.signum = 0;
            return;
        }
        let mut mask = mask;
        unsafe {
            assert_eq!(libc::sigismember(&mask, signum), 1, "signum is not a member of mask");
            libc::sigdelset(&mut mask, signum);
        }
        sel.signum = signum;
        sel.sigmask = mask;
    }

    /// Waits until at least one enabled descriptor is ready, `deadline`
    /// passes, or a signal interrupts the wait.
    pub fn wait(&self, deadline: Instant) -> WaitOutcome {
        let mut sel = self.inner.borrow_mut();
        #[cfg(debug_assertions)]
        sel.validate();

        if sel.pend_count != 0 {
            probe::zero_all(&mut sel.results);
        }

        let n_bytes = probe::tables().byte_count[sel.fd_last as usize] as usize;
        let mut fd_sets: [*mut libc::fd_set; MODE_COUNT] = [std::ptr::null_mut(); MODE_COUNT];
        let mut pend_mode = None;

        for mode in ALL_MODES {
            let idx = mode.index();
            sel.tried_count[idx] = sel.enabled_count[idx];
            if sel.tried_count[idx] == 0 {
                continue;
            }
            // Split borrow: copy the prefix out of `enabled[idx]` into
            // `results[idx]`, which the borrow checker would otherwise
            // refuse as two overlapping borrows of the same array.
            let sel = &mut *sel;
            let (enabled, results) = split_mode(&mut sel.enabled, &mut sel.results, idx);
            results.copy_prefix_from(enabled, n_bytes);
            fd_sets[idx] = results.as_raw_mut_ptr();
            if pend_mode.is_none() {
                pend_mode = Some(mode);
            }
        }
        sel.pend_mode = pend_mode;
        sel.tried_fd_last = sel.fd_last;
        sel.pend_fd = 0;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let ts = libc::timespec {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(remaining.subsec_nanos() as i32),
        };
        let sigmask_ptr = if sel.signum != 0 { &sel.sigmask as *const libc::sigset_t } else { std::ptr::null() };

        log::trace!("wait: pselect over {} descriptor(s), nfds={}", sel.fd_count, sel.fd_last + 1);
        let n = unsafe {
            libc::pselect(
                sel.fd_last + 1,
                fd_sets[Mode::Read.index()],
                fd_sets[Mode::Write.index()],
                fd_sets[Mode::Error.index()],
                &ts,
                sigmask_ptr,
            )
        };

        if n > 0 {
            assert!(sel.pend_mode.is_some(), "pselect reported readiness with no mode armed");
            sel.pend_count = n as usize;
            log::debug!("wait: {} descriptor(s) ready", n);
            return WaitOutcome::Ready(n as usize);
        }

        probe::zero_all(&mut sel.results);
        sel.pend_count = 0;

        if n == 0 {
            log::trace!("wait: timed out");
            return WaitOutcome::TimedOut;
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            log::debug!("wait: interrupted by signal");
            return WaitOutcome::Interrupted;
        }
        panic!("pselect failed: {}", err);
    }

    /// Dispatches the next ready descriptor's callback for its
    /// highest-priority pending mode, returning how many dispatches
    /// remain after this one. Returns `0` immediately, without
    /// invoking anything, if nothing is pending.
    pub fn dispatch_next(&self) -> usize {
        #[cfg(debug_assertions)]
        self.inner.borrow().validate();

        let (fd, mode, file) = {
            let mut sel = self.inner.borrow_mut();
            if sel.pend_count == 0 {
                return 0;
            }
            let (fd, mode) = sel.advance_cursor();
            sel.pend_count -= 1;
            sel.pend_fd = fd;
            let file = sel.get(fd).expect("dispatch target missing from storage");
            (fd, mode, file)
        };

        let (action, cookie) = {
            let finner = file.inner.borrow();
            debug_assert!(finner.enabled.contains(mode.bit()), "dispatched fd {} not enabled for {:?}", fd, mode);
            let action = finner.actions[mode.index()]
                .clone()
                .unwrap_or_else(|| panic!("no callback set for fd {} mode {:?}", fd, mode));
            let cookie = finner.cookie.expect("attached file has a cookie");
            (action, cookie)
        };

        log::trace!("dispatch: fd {} mode {:?}", fd, mode);
        (action.borrow_mut())(self, &file, cookie);

        self.inner.borrow().pend_count
    }
}

fn split_mode<'a>(
    enabled: &'a mut [DescriptorSet; MODE_COUNT],
    results: &'a mut [DescriptorSet; MODE_COUNT],
    idx: usize,
) -> (&'a DescriptorSet, &'a mut DescriptorSet) {
    (&enabled[idx], &mut results[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selection_wait_times_out_immediately() {
        let sel: Selection<()> = Selection::new();
        let outcome = sel.wait(Instant::now());
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn attach_rejects_double_attach() {
        let sel: Selection<u32> = Selection::new();
        let f = File::new();
        sel.attach(&f, 3, 7);
        assert!(f.is_attached());
        assert_eq!(f.fd(), Some(3));
        assert_eq!(f.cookie(), Some(7));
    }

    #[test]
    #[should_panic]
    fn attaching_twice_is_fatal() {
        let sel: Selection<u32> = Selection::new();
        let f = File::new();
        sel.attach(&f, 3, 7);
        sel.attach(&f, 3, 7);
    }

    #[test]
    fn detach_clears_attachment() {
        let sel: Selection<u32> = Selection::new();
        let f = File::new();
        sel.attach(&f, 3, 7);
        sel.detach(&f);
        assert!(!f.is_attached());
        assert_eq!(sel.len(), 0);
    }

    #[test]
    fn sparse_to_dense_conversion_preserves_membership() {
        let sel: Selection<u32> = Selection::new();
        let fds = [5, 1, 9, 20, 3, 14, 7, 12, 30, 2];
        let mut files = Vec::new();
        for &fd in &fds {
            let f = File::new();
            sel.attach(&f, fd, fd as u32);
            files.push(f);
        }
        assert_eq!(sel.len(), fds.len());
        for (i, &fd) in fds.iter().enumerate() {
            assert_eq!(files[i].fd(), Some(fd));
        }
    }

    #[test]
    fn ream_drains_every_attached_file() {
        let sel: Selection<u32> = Selection::new();
        for fd in [1, 2, 3] {
            let f = File::new();
            sel.attach(&f, fd, fd as u32);
        }
        let mut drained = 0;
        while sel.ream(false).is_some() {
            drained += 1;
        }
        assert_eq!(drained, 3);
        assert_eq!(sel.len(), 0);
        assert!(sel.ream(false).is_none());
    }

    #[test]
    fn disable_modes_retracts_pending_results() {
        let sel: Selection<u32> = Selection::new();
        let f = File::new();
        sel.attach(&f, 3, 1);
        sel.enable_mode(&f, Mode::Read, Some(Rc::new(RefCell::new(|_: &Selection<u32>, _: &File<u32>, _: u32| {}))));
        assert!(f.enabled().contains(ModeMask::READ));
        sel.disable_modes(&f, ModeMask::all());
        assert!(f.enabled().is_empty());
    }
}
