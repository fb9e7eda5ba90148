//! Frame-pointer walking for trap backtraces.
//!
//! Generated code keeps frame pointers, so each frame record is the pair
//! `[fp] = caller's fp` and `[fp + 8] = return address`. The walk runs
//! inside the signal handler and therefore only reads memory it has bounds
//! for and never allocates.

use crate::trap::{Frame, MAX_TRAP_FRAMES};

/// Records never sit this close to the low end of the stack.
const STACK_RED_ZONE: usize = 16 * 1024;

/// Fills `frames` starting with `(pc, fp)` and following the frame-pointer
/// chain for as long as it stays within `stack`. Returns how many frames
/// were written.
///
/// `stack` is `(low, high)`; an empty range records only the top frame.
/// When `jit_range` is known the walk also stops at the first return
/// address outside generated code.
pub(super) fn walk_frames(
    pc: usize,
    fp: usize,
    stack: (usize, usize),
    jit_range: Option<(u64, u64)>,
    frames: &mut [Frame; MAX_TRAP_FRAMES],
) -> usize {
    frames[0] = Frame { pc, fp };
    let (low, high) = stack;
    if high <= low {
        return 1;
    }
    let valid = |fp: usize| {
        fp >= low.saturating_add(STACK_RED_ZONE)
            && fp.saturating_add(2 * size_of::<usize>()) <= high
            && fp % 16 == 0
    };

    let mut count = 1;
    let mut fp = fp;
    while count < MAX_TRAP_FRAMES && valid(fp) {
        let (prev_fp, ret) = unsafe {
            let record = fp as *const usize;
            (*record, *record.add(1))
        };
        if ret == 0 {
            break;
        }
        if let Some((start, end)) = jit_range {
            if !(start..end).contains(&(ret as u64)) {
                break;
            }
        }
        frames[count] = Frame { pc: ret, fp: prev_fp };
        count += 1;
        if prev_fp <= fp {
            break;
        }
        fp = prev_fp;
    }
    count
}
