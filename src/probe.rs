//! Descriptor-set layout probe and bit-scan helpers.
//!
//! The host's `fd_set` is opaque as far as the C ABI is concerned: we
//! are told it is a bit vector but not its word size, endianness, or
//! per-byte bit order. [`tables`] runs a one-time probe (gated by a
//! [`OnceLock`]) that proves the overlay below is a valid
//! reinterpretation of `libc::fd_set` and builds the lookup tables
//! every subsequent scan relies on. Any failure here means the rest of
//! the crate cannot safely run on this host, so every check is an
//! unconditional `assert!`.

use std::mem::size_of;
use std::sync::OnceLock;

use crate::Descriptor;

/// Width of the word overlay used for skipping runs of zero bits.
const WORD_BITS: u32 = 32;
type Word = u32;

/// A descriptor set, laid out exactly like `libc::fd_set`.
///
/// All bit manipulation goes through `libc`'s `FD_*` primitives or,
/// once the layout has been proven, through the byte/word overlay
/// built by [`tables`].
#[repr(transparent)]
pub struct DescriptorSet(libc::fd_set);

impl DescriptorSet {
    pub fn empty() -> Self {
        unsafe {
            let mut raw: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut raw);
            DescriptorSet(raw)
        }
    }

    pub fn set(&mut self, fd: Descriptor) {
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    pub fn clear(&mut self, fd: Descriptor) {
        unsafe { libc::FD_CLR(fd, &mut self.0) }
    }

    pub fn is_set(&self, fd: Descriptor) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    pub fn as_raw_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }

    fn n_words() -> usize {
        size_of::<libc::fd_set>() / size_of::<Word>()
    }

    fn n_bytes() -> usize {
        size_of::<libc::fd_set>()
    }

    fn word_at(&self, idx: usize) -> Word {
        debug_assert!(idx < Self::n_words());
        unsafe { *(&self.0 as *const _ as *const Word).add(idx) }
    }

    fn byte_at(&self, idx: usize) -> u8 {
        debug_assert!(idx < Self::n_bytes());
        unsafe { *(&self.0 as *const _ as *const u8).add(idx) }
    }

    /// Copy the first `n_bytes` bytes of `src` into `self`, leaving the
    /// rest of `self` untouched. Used by `wait` to stage only the
    /// prefix of `enabled[mode]` that can possibly contain a bit below
    /// `fd_last`.
    pub fn copy_prefix_from(&mut self, src: &DescriptorSet, n_bytes: usize) {
        debug_assert!(n_bytes <= Self::n_bytes());
        unsafe {
            std::ptr::copy_nonoverlapping(
                &src.0 as *const _ as *const u8,
                &mut self.0 as *mut _ as *mut u8,
                n_bytes,
            );
        }
    }
}

/// spec.md §4.1 step 6/7 and §4.2: the tables every scan is built on.
pub struct ProbeTables {
    word_index: Vec<u16>,
    byte_index: Vec<u16>,
    pub byte_count: Vec<u16>,
    first_in_byte: [i8; 256],
}

static PROBE: OnceLock<ProbeTables> = OnceLock::new();

/// Returns the process-wide probe tables, running the probe on first
/// use. Mirrors spec.md's `map_made` gate: the probe runs exactly
/// once, its tables are read-only afterwards.
pub fn tables() -> &'static ProbeTables {
    PROBE.get_or_init(build_probe_tables)
}

fn build_probe_tables() -> ProbeTables {
    let max_fd = crate::MAX_FD;
    let word_bytes = size_of::<Word>();
    assert!(
        size_of::<libc::fd_set>() % word_bytes == 0,
        "fd_set size is not a multiple of the probe word size"
    );

    // Steps 1 & 2: a zeroed set must report no members and no nonzero words.
    let empty = DescriptorSet::empty();
    for fd in 0..max_fd as Descriptor {
        assert!(!empty.is_set(fd), "zeroed descriptor set reports a member");
    }
    for iw in 0..DescriptorSet::n_words() {
        assert_eq!(empty.word_at(iw), 0, "zeroed descriptor set has a nonzero word");
    }

    let mut word_index = vec![0u16; max_fd];
    let mut byte_index = vec![0u16; max_fd];
    let mut bit_mask = vec![0u8; max_fd];

    // Step 3: set/clear every fd in isolation and record where its bit lives.
    for fd in 0..max_fd {
        let mut set = DescriptorSet::empty();
        set.set(fd as Descriptor);

        let mut found_word = None;
        for iw in 0..DescriptorSet::n_words() {
            let w = set.word_at(iw);
            if w != 0 {
                assert!(found_word.is_none(), "FD_SET set a bit in more than one word");
                assert!(w & (w - 1) == 0, "FD_SET set more than one bit in a word");
                found_word = Some(iw);
            }
        }
        let iw = found_word.expect("FD_SET did not set any bit in any word");

        let word_byte_range = (iw * word_bytes)..((iw + 1) * word_bytes);
        let mut found_byte = None;
        for ib in word_byte_range.clone() {
            let b = set.byte_at(ib);
            if b != 0 {
                assert!(found_byte.is_none(), "FD_SET set a bit in more than one byte of its word");
                assert_eq!(b.count_ones(), 1, "FD_SET set more than one bit in a byte");
                found_byte = Some(ib);
            }
        }
        let ib = found_byte.expect("FD_SET set something beyond the expected bytes");

        word_index[fd] = iw as u16;
        byte_index[fd] = ib as u16;
        bit_mask[fd] = set.byte_at(ib);

        set.clear(fd as Descriptor);
        for iw in 0..DescriptorSet::n_words() {
            assert_eq!(set.word_at(iw), 0, "FD_CLR did not leave the descriptor set empty");
        }
    }

    // Step 4: 8 contiguous fds share a byte, and no two groups collide.
    for fd in (0..max_fd).step_by(8) {
        let ib = byte_index[fd] as usize;
        let iw = word_index[fd] as usize;
        for fds in (fd + 1)..(fd + 8).min(max_fd) {
            assert_eq!(byte_index[fds] as usize, ib, "not 8 contiguous fds in a byte");
        }
        for fds in (0..max_fd).step_by(8) {
            if fds != fd {
                assert_ne!(byte_index[fds] as usize, ib, "fds not in expected bytes");
            }
        }
        assert!(
            ib >= iw * word_bytes && ib < (iw + 1) * word_bytes,
            "fds not in expected words"
        );
    }

    // Step 5: bit position depends only on fd mod 8.
    for r in 0..8 {
        let b = bit_mask[r];
        let mut fd = 8 + r;
        while fd < max_fd {
            assert_eq!(bit_mask[fd], b, "inconsistent bit mapping for fd mod 8");
            fd += 8;
        }
    }

    // Step 6: byte value -> lowest-numbered (mod 8) fd whose bit it carries.
    let mut first_in_byte = [-1i8; 256];
    for r in 0..8usize {
        let b = bit_mask[r];
        for i in 1..256usize {
            if first_in_byte[i] == -1 && (i as u8 & b) != 0 {
                first_in_byte[i] = r as i8;
            }
        }
    }
    for (i, slot) in first_in_byte.iter().enumerate().skip(1) {
        assert!(*slot != -1, "byte value {} has no assigned fd", i);
    }

    // Step 7: minimum byte-prefix length covering fds 0..=fd.
    let mut byte_count = vec![0u16; max_fd];
    let mut max_so_far = 0u16;
    for fd in 0..max_fd {
        let c = byte_index[fd] + 1;
        if c > max_so_far {
            max_so_far = c;
        }
        byte_count[fd] = max_so_far;
    }

    log::debug!("descriptor-set layout probe succeeded for {} descriptors", max_fd);

    ProbeTables {
        word_index,
        byte_index,
        byte_count,
        first_in_byte,
    }
}

/// spec.md §4.2 `scan_next`: smallest set bit `>= fd_start`, `<= fd_last`,
/// clearing it as a side effect. `None` if no such bit exists.
pub fn scan_next(set: &mut DescriptorSet, mut fd: Descriptor, fd_last: Descriptor) -> Option<Descriptor> {
    if fd > fd_last {
        return None;
    }
    let t = tables();

    while set.word_at(t.word_index[fd as usize] as usize) == 0 {
        fd = (fd & !(WORD_BITS as Descriptor - 1)) + WORD_BITS as Descriptor;
        if fd > fd_last {
            return None;
        }
    }

    fd &= !0x7;
    let mut b = set.byte_at(t.byte_index[fd as usize] as usize);
    while b == 0 {
        fd += 8;
        if fd > fd_last {
            return None;
        }
        b = set.byte_at(t.byte_index[fd as usize] as usize);
    }

    fd += t.first_in_byte[b as usize] as Descriptor;
    debug_assert!(fd <= fd_last);
    set.clear(fd);
    Some(fd)
}

/// spec.md §4.2 `zero`: clear every set in `sets`.
pub fn zero_all(sets: &mut [DescriptorSet]) {
    for set in sets {
        *set = DescriptorSet::empty();
    }
}

/// spec.md §4.2 `popcount`: total set bits across `sets`.
pub fn count_set_bits(sets: &[DescriptorSet]) -> usize {
    let mut count = 0;
    for set in sets {
        for iw in 0..DescriptorSet::n_words() {
            count += set.word_at(iw).count_ones() as usize;
        }
    }
    count
}

/// spec.md §4.2 `compare`: byte-wise equality of two sets.
pub fn sets_equal(a: &DescriptorSet, b: &DescriptorSet) -> bool {
    for ib in 0..DescriptorSet::n_bytes() {
        if a.byte_at(ib) != b.byte_at(ib) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_runs_and_is_idempotent() {
        let a = tables() as *const ProbeTables;
        let b = tables() as *const ProbeTables;
        assert_eq!(a, b, "probe tables must be built exactly once");
    }

    #[test]
    fn byte_count_is_monotonic() {
        let t = tables();
        for w in t.byte_count.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn scan_next_finds_descriptors_in_order() {
        let mut set = DescriptorSet::empty();
        set.set(3);
        set.set(7);
        set.set(12);

        let mut found = Vec::new();
        let mut fd = 0;
        while let Some(next) = scan_next(&mut set, fd, 63) {
            found.push(next);
            fd = next + 1;
        }
        assert_eq!(found, vec![3, 7, 12]);
        assert_eq!(count_set_bits(std::slice::from_ref(&set)), 0);
    }

    #[test]
    fn scan_next_respects_fd_last() {
        let mut set = DescriptorSet::empty();
        set.set(5);
        set.set(40);
        assert_eq!(scan_next(&mut set, 0, 10), Some(5));
        assert_eq!(scan_next(&mut set, 6, 10), None);
    }

    #[test]
    fn zero_all_clears_every_set() {
        let mut sets = [DescriptorSet::empty(), DescriptorSet::empty()];
        sets[0].set(1);
        sets[1].set(2);
        zero_all(&mut sets);
        assert_eq!(count_set_bits(&sets), 0);
    }

    #[test]
    fn copy_prefix_copies_only_requested_bytes() {
        let mut src = DescriptorSet::empty();
        src.set(0);
        src.set(500);
        let mut dst = DescriptorSet::empty();
        dst.copy_prefix_from(&src, 1);
        assert!(dst.is_set(0));
        assert!(!dst.is_set(500));
    }
}
