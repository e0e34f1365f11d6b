//! Blob buffers and their recycling pool.
//!
//! A `Blob` is the unit of payload in the runtime: a contiguous byte
//! region with a *readable* prefix (`len`) and a *writable* remainder up
//! to `capacity`. Receive operations hand the writable region to the
//! kernel and commit the readable length afterward; send operations only
//! read the readable prefix.
//!
//! `BlobPool` recycles backing allocations across operations so the
//! receive path does not allocate per datagram.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// A contiguous byte buffer with separate readable and writable regions.
#[derive(Debug, Default)]
pub struct Blob {
    data: Vec<u8>,
}

impl Blob {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Copy `bytes` into a fresh blob whose readable region is exactly
    /// those bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    /// Adopt `data` as the readable region without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Length of the readable region.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total size of the underlying region (readable + writable).
    pub fn total_size(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Grow the writable region so exactly `size` bytes can be written
    /// after the current readable region.
    pub fn reserve_writable(&mut self, size: usize) {
        self.data.reserve(size);
    }

    /// Raw pointer and length of the writable region, for scatter I/O.
    ///
    /// The returned region is uninitialized; the caller must not read it
    /// before committing a length with [`commit`](Self::commit).
    pub fn writable(&mut self) -> (*mut u8, usize) {
        let len = self.data.len();
        let cap = self.data.capacity();
        let ptr = unsafe { self.data.as_mut_ptr().add(len) };
        (ptr, cap - len)
    }

    /// Extend the readable region by `count` bytes that the kernel wrote
    /// into the writable region.
    ///
    /// # Safety
    ///
    /// The first `count` bytes of the writable region must have been
    /// initialized.
    pub unsafe fn commit(&mut self, count: usize) {
        let len = self.data.len();
        debug_assert!(len + count <= self.data.capacity());
        self.data.set_len(len + count);
    }

    /// Append bytes to the readable region.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Truncate the readable region.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Drop all content, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn into_storage(self) -> Vec<u8> {
        self.data
    }

    fn from_storage(mut data: Vec<u8>) -> Self {
        data.clear();
        Self { data }
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// A lock-free pool of blob backing storage.
///
/// `allocate` pops a recycled allocation when one exists; `recycle`
/// returns one, silently dropping it when the pool is full.
pub struct BlobPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BlobPool {
    /// A pool retaining up to `depth` buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(depth.max(1)),
            buffer_size,
        })
    }

    /// The size of buffers this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pop a recycled blob or allocate a fresh one. The blob is empty
    /// with at least `buffer_size` writable bytes.
    pub fn allocate(&self) -> Blob {
        match self.free.pop() {
            Some(storage) => {
                let mut blob = Blob::from_storage(storage);
                if blob.total_size() < self.buffer_size {
                    blob.reserve_writable(self.buffer_size);
                }
                blob
            }
            None => Blob::with_capacity(self.buffer_size),
        }
    }

    /// Return a blob's storage to the pool.
    pub fn recycle(&self, blob: Blob) {
        let _ = self.free.push(blob.into_storage());
    }

    /// Number of buffers currently cached.
    pub fn cached(&self) -> usize {
        self.free.len()
    }
}
