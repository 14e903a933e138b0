/// log2 of the number of bytes in a word. All reference slots are word sized.
pub const LOG_BYTES_IN_WORD: usize = 3;
/// The number of bytes in a word.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the heap page granule. Pages are the unit of live accounting, and
/// the stripe hash discards address bits below this shift so that references
/// into the same page always land on the same stripe.
pub const LOG_BYTES_IN_PAGE: usize = 21;
/// The number of bytes in a heap page.
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the smallest object-array slice that is deferred as a
/// partial-array entry instead of scanned inline.
pub const LOG_PARTIAL_ARRAY_MIN_SIZE: usize = 12;
/// The partial-array granule in bytes. Deferred array slices are aligned to
/// this size, which is what makes the offset encoding in a mark stack entry
/// exact.
pub const PARTIAL_ARRAY_MIN_SIZE: usize = 1 << LOG_PARTIAL_ARRAY_MIN_SIZE;

/// Hard limit on the number of mark stripes. The active-stripe bitmap in the
/// termination word is 32 bits wide, so this can never be raised past 32.
pub const MARK_STRIPES_LIMIT: usize = 32;

/// Entries per mark stack. Sized so a stack (header included) is exactly
/// [`MARK_STACK_BYTES`].
pub const MARK_STACK_SLOTS: usize = 255;
/// Size of one mark stack in bytes. The slab is carved at this granularity.
pub const MARK_STACK_BYTES: usize = 2048;

/// Free stacks a thread may cache locally before returning them to the
/// shared allocator.
pub const MARK_STACK_MAGAZINE_CAPACITY: usize = 8;
