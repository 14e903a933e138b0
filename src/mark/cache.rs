use crate::util::constants::LOG_BYTES_IN_PAGE;
use crate::heap::MarkablePage;

/// Per-worker cache of live-byte increments.
///
/// Marking the same page repeatedly is common, and pages count live bytes
/// with atomics. The cache batches increments per page and only pushes them
/// out on eviction (two pages hashing to the same slot) or when the worker
/// finishes, so the atomics are touched once per page run instead of once
/// per object.
pub struct MarkCache<'h, P: MarkablePage> {
    entries: Vec<MarkCacheEntry<'h, P>>,
    mask: usize,
}

struct MarkCacheEntry<'h, P: MarkablePage> {
    page: Option<&'h P>,
    objects: usize,
    bytes: usize,
}

impl<'h, P: MarkablePage> MarkCache<'h, P> {
    pub fn new(nstripes: usize) -> Self {
        debug_assert!(nstripes.is_power_of_two());
        MarkCache {
            entries: (0..nstripes)
                .map(|_| MarkCacheEntry {
                    page: None,
                    objects: 0,
                    bytes: 0,
                })
                .collect(),
            mask: nstripes - 1,
        }
    }

    pub fn inc_live(&mut self, page: &'h P, bytes: usize) {
        let index = (page.start().as_usize() >> LOG_BYTES_IN_PAGE) & self.mask;
        let entry = &mut self.entries[index];
        if let Some(cached) = entry.page {
            if std::ptr::eq(cached, page) {
                entry.objects += 1;
                entry.bytes += bytes;
                return;
            }
            // Conflict: push the old page's counts out and take the slot.
            cached.inc_live(entry.objects, entry.bytes);
        }
        entry.page = Some(page);
        entry.objects = 1;
        entry.bytes = bytes;
    }

    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            if let Some(page) = entry.page.take() {
                page.inc_live(entry.objects, entry.bytes);
                entry.objects = 0;
                entry.bytes = 0;
            }
        }
    }
}

impl<'h, P: MarkablePage> Drop for MarkCache<'h, P> {
    fn drop(&mut self) {
        self.flush();
    }
}
