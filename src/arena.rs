/*
    TrackFlux
    https://github.com/dbalsom/trackflux

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/arena.rs

    Bump-pointer scratch arena. Allocations are 4-byte aligned and never
    freed individually; the arena is sized once by the mount layer and holds
    transient structures built during open, such as derived type tables.
*/

use bytemuck::Pod;

pub struct Arena {
    buf: Box<[u32]>,
    used: usize,
}

impl Arena {
    /// `capacity` is rounded up to a multiple of 4 bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            buf: vec![0u32; (capacity + 3) / 4].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.buf.len() * 4
    }

    pub fn avail(&self) -> usize {
        self.total() - self.used
    }

    /// Allocate `len` bytes, zero-filled. Panics if the arena is exhausted.
    pub fn alloc(&mut self, len: usize) -> &mut [u8] {
        let start = self.used;
        let end = start + ((len + 3) & !3);
        assert!(end <= self.total(), "arena exhausted: {} > {}", end, self.total());
        self.used = end;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.buf);
        let out = &mut bytes[start..start + len];
        out.fill(0);
        out
    }

    /// Allocate a zeroed slice of `n` plain-data records.
    pub fn alloc_slice<T: Pod>(&mut self, n: usize) -> &mut [T] {
        bytemuck::cast_slice_mut(self.alloc(n * std::mem::size_of::<T>()))
    }

    /// Discard everything. Existing borrows keep this safe to call only
    /// between mounts.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_alignment() {
        let mut arena = Arena::with_capacity(64);
        let a = arena.alloc(3).as_ptr() as usize;
        let b = arena.alloc(5).as_ptr() as usize;
        assert_eq!(b - a, 4);
        assert_eq!(arena.avail(), 64 - 12);
    }

    #[test]
    #[should_panic(expected = "arena exhausted")]
    fn test_overflow_asserts() {
        let mut arena = Arena::with_capacity(16);
        arena.alloc(12);
        arena.alloc(8);
    }

    #[test]
    fn test_typed_slices() {
        let mut arena = Arena::with_capacity(256);
        let words: &mut [u16] = arena.alloc_slice(9);
        assert_eq!(words.len(), 9);
        words[8] = 0x1234;
        assert_eq!(words[8], 0x1234);
    }
}
