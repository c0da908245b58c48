/// Width of the acknowledgement window carried by every wire message.
pub const ACK_WINDOW: u32 = 32;

/// Signed wraparound distance from `b` to `a`.
///
/// Positive when `a` is newer than `b`, negative when older. Counters cycle
/// through the full `u32` range over a long session, so plain `<`/`>` must
/// never be used on them.
#[inline]
pub fn sequence_distance(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    sequence_distance(s1, s2) > 0
}

/// Offset of `sequence` inside the window ending at `ack`, if it falls in it.
#[inline]
pub fn ack_offset(ack: u32, sequence: u32) -> Option<u32> {
    let distance = sequence_distance(ack, sequence);
    if (0..ACK_WINDOW as i32).contains(&distance) {
        Some(distance as u32)
    } else {
        None
    }
}
