//! Host buffers shared with a verbs device.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// A zero-initialized host buffer that can be mapped for device DMA.
///
/// Cloning yields another reference to the same memory: the owner keeps one
/// clone and the device keeps another for the lifetime of the mapping, the
/// same way a bus address aliases the host allocation.
#[derive(Clone)]
pub struct DmaBuf {
    inner: Arc<Mutex<BytesMut>>,
}

impl DmaBuf {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BytesMut::zeroed(len))),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the buffer contents.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard[..])
    }

    /// Run `f` over the buffer contents mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard[..])
    }

    /// Copy the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|b| b.to_vec())
    }

    /// Whether both values reference the same allocation.
    pub fn ptr_eq(&self, other: &DmaBuf) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf").field("len", &self.len()).finish()
    }
}
