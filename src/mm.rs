// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-granular shared memory.
//!
//! A [`Page`] is mutated concurrently by both domains once granted, so all
//! access goes through atomics. The page is stored as 32-bit words: the ring
//! control fields are words and get word-sized loads and stores, while slot
//! and payload data use byte-granular copies that read-modify-write the
//! boundary words. Byte `i` of the page is byte `i % 4` of the word's
//! little-endian representation, which keeps the layout identical on either
//! end regardless of host endianness.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The platform page size.
pub const PAGE_SIZE: usize = 4096;

const PAGE_WORDS: usize = PAGE_SIZE / 4;

/// A page-sized shared buffer.
///
/// Cloning aliases the same memory, which is how the simulated peer maps a
/// granted page.
#[derive(Clone)]
pub struct Page {
    words: Arc<[AtomicU32; PAGE_WORDS]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish()
    }
}

impl Page {
    /// Allocates a new zero-filled page.
    pub fn new_zeroed() -> Self {
        Self {
            words: Arc::new([0u32; PAGE_WORDS].map(AtomicU32::new)),
        }
    }

    /// Loads the 32-bit word at byte offset `offset`, which must be
    /// word-aligned.
    pub fn load(&self, offset: usize, ordering: Ordering) -> u32 {
        debug_assert!(offset % 4 == 0);
        self.words[offset / 4].load(ordering)
    }

    /// Stores the 32-bit word at byte offset `offset`, which must be
    /// word-aligned.
    pub fn store(&self, offset: usize, value: u32, ordering: Ordering) {
        debug_assert!(offset % 4 == 0);
        self.words[offset / 4].store(value, ordering);
    }

    /// Copies `data.len()` bytes out of the page starting at `offset`.
    pub fn read_at(&self, mut offset: usize, data: &mut [u8]) {
        assert!(offset + data.len() <= PAGE_SIZE);
        let mut data = data;
        while !data.is_empty() {
            let word = self.words[offset / 4].load(Ordering::Relaxed).to_le_bytes();
            let start = offset % 4;
            let len = (4 - start).min(data.len());
            let (this, rest) = data.split_at_mut(len);
            this.copy_from_slice(&word[start..start + len]);
            offset += len;
            data = rest;
        }
    }

    /// Copies `data` into the page starting at `offset`.
    ///
    /// Boundary words are read back and merged, so the caller must be the
    /// sole writer of the touched range.
    pub fn write_at(&self, mut offset: usize, mut data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE);
        while !data.is_empty() {
            let index = offset / 4;
            let start = offset % 4;
            let len = (4 - start).min(data.len());
            let (this, rest) = data.split_at(len);
            let word = if len == 4 {
                u32::from_le_bytes(this.try_into().unwrap())
            } else {
                let mut bytes = self.words[index].load(Ordering::Relaxed).to_le_bytes();
                bytes[start..start + len].copy_from_slice(this);
                u32::from_le_bytes(bytes)
            };
            self.words[index].store(word, Ordering::Relaxed);
            offset += len;
            data = rest;
        }
    }
}

/// Error returned when the page allocator is exhausted.
#[derive(Debug, Error)]
#[error("out of pages")]
pub struct OutOfPages;

/// Allocates page-aligned, page-sized buffers.
pub trait PageAllocator: Send + Sync {
    /// Allocates one zeroed page.
    fn alloc(&self) -> Result<Page, OutOfPages>;

    /// Allocates `n` zeroed pages.
    fn alloc_n(&self, n: usize) -> Result<Vec<Page>, OutOfPages> {
        (0..n).map(|_| self.alloc()).collect()
    }
}

/// An unbounded heap-backed page allocator.
pub struct HeapPages;

impl PageAllocator for HeapPages {
    fn alloc(&self) -> Result<Page, OutOfPages> {
        Ok(Page::new_zeroed())
    }
}

#[cfg(test)]
mod tests {
    use super::Page;
    use super::PAGE_SIZE;
    use std::sync::atomic::Ordering;

    #[test]
    fn byte_copies_round_trip() {
        let page = Page::new_zeroed();
        let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        // Unaligned start and end to exercise the boundary merge.
        page.write_at(3, &data);
        let mut back = vec![0u8; 300];
        page.read_at(3, &mut back);
        assert_eq!(back, data);

        // Neighboring bytes are untouched.
        let mut edge = [0xffu8; 1];
        page.read_at(2, &mut edge);
        assert_eq!(edge, [0]);
    }

    #[test]
    fn word_access_is_coherent_with_bytes() {
        let page = Page::new_zeroed();
        page.store(8, 0x11223344, Ordering::Relaxed);
        let mut bytes = [0u8; 4];
        page.read_at(8, &mut bytes);
        assert_eq!(bytes, 0x11223344u32.to_le_bytes());
    }

    #[test]
    fn full_page_copy() {
        let page = Page::new_zeroed();
        let data = vec![0xabu8; PAGE_SIZE];
        page.write_at(0, &data);
        let mut back = vec![0u8; PAGE_SIZE];
        page.read_at(0, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn clones_alias_the_same_memory() {
        let page = Page::new_zeroed();
        let alias = page.clone();
        page.write_at(100, &[1, 2, 3]);
        let mut back = [0u8; 3];
        alias.read_at(100, &mut back);
        assert_eq!(back, [1, 2, 3]);
    }
}
