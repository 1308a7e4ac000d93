use std::sync::Arc;

use cache_advisor::CacheAdvisor;
use fnv::FnvHashMap;
use parking_lot::Mutex;

/// Clean (validated, unprotected) page images by `(file, page)`.
pub(crate) struct PageCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    pages: FnvHashMap<u64, Arc<[u8]>>,
    advisor: CacheAdvisor,
}

fn key(file: u32, page: u32) -> u64 {
    (u64::from(file) << 32) | u64::from(page)
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> PageCache {
        PageCache {
            inner: Mutex::new(CacheInner {
                pages: FnvHashMap::default(),
                advisor: CacheAdvisor::new(capacity.max(256), 80),
            }),
        }
    }

    pub(crate) fn get(&self, file: u32, page: u32) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        let key = key(file, page);
        let found = inner.pages.get(&key).cloned()?;
        inner.accessed(key, found.len());
        Some(found)
    }

    /// Stores a clean page image, replacing an older image of the page.
    pub(crate) fn write(&self, file: u32, page: u32, bytes: &[u8]) -> Arc<[u8]> {
        let image: Arc<[u8]> = Arc::from(bytes);
        let mut inner = self.inner.lock();
        let key = key(file, page);
        inner.pages.insert(key, image.clone());
        inner.accessed(key, image.len());
        image
    }

    /// Forgets every page of `file`.
    pub(crate) fn flush_all(&self, file: u32) {
        let mut inner = self.inner.lock();
        inner.pages.retain(|key, _| (key >> 32) as u32 != file);
    }

    pub(crate) fn invalidate(&self, file: u32, page: u32) {
        self.inner.lock().pages.remove(&key(file, page));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }
}

impl CacheInner {
    fn accessed(&mut self, key: u64, size: usize) {
        let to_evict = self.advisor.accessed_reuse_buffer(key, size);
        let evicted: Vec<u64> = to_evict.iter().map(|(evict, _rough_size)| *evict).collect();
        for evict in evicted {
            if evict != key {
                self.pages.remove(&evict);
            }
        }
    }
}
