//! A level-triggered, single-threaded I/O readiness multiplexer built
//! on `pselect(2)`.
//!
//! A [`Selection`] owns a set of [`File`] records, each attached under
//! a descriptor with callbacks for the modes it cares about (error,
//! read, write). [`Selection::wait`] blocks until something is ready
//! or `deadline` passes; [`Selection::dispatch_next`] then walks the
//! ready descriptors back out to their callbacks, error before read
//! before write, lowest descriptor first within a mode.

mod file;
mod mode;
mod probe;
mod selection;

pub use file::{Action, File};
pub use mode::{Mode, ModeMask, ALL_MODES, MODE_COUNT};
pub use selection::{Selection, WaitOutcome};

use std::os::unix::io::RawFd;

/// A raw file descriptor.
pub type Descriptor = RawFd;

/// Largest descriptor value this multiplexer can track, fixed by the
/// host's `fd_set` capacity.
pub const MAX_FD: usize = libc::FD_SETSIZE;
