//! Test support: timing helpers, a serializing guard for tests that touch
//! global state, and a mock heap binding for exercising the marker without a
//! real heap.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::heap::{DirectorHeap, HeapModel, HeapSnapshot, MarkablePage, PageMark};
use crate::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD, LOG_BYTES_IN_PAGE};
use crate::util::Address;

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(_) => panic!("Thread took too long"),
    }
}

lazy_static! {
    static ref SERIAL_TEST_MUTEX: Mutex<()> = Mutex::new(());
}

/// Run a test while holding a global lock, for tests that touch shared
/// global state such as the mark sequence number.
pub fn serial_test<F: FnOnce()>(f: F) {
    let guard = SERIAL_TEST_MUTEX.lock();
    // A previous test may have panicked while holding the mutex.
    let _guard = match guard {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f();
}

/// Base address of the mock heap. Arbitrary, page aligned.
const MOCK_HEAP_BASE: usize = 0x1000_0000;

/// Header bytes preceding an object's payload in the mock layout.
pub const MOCK_OBJECT_HEADER: usize = 16;

const UNMARKED: u8 = 0;
const MARKED_FINALIZABLE: u8 = 1;
const MARKED_STRONG: u8 = 2;

struct MockObject {
    size: usize,
    refs: Vec<Address>,
    is_array: bool,
}

pub struct MockPage {
    start: Address,
    marks: HashMap<usize, AtomicU8>,
    live_objects: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl MockPage {
    fn new(start: Address) -> Self {
        MockPage {
            start,
            marks: HashMap::new(),
            live_objects: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    fn mark_word(&self, addr: Address) -> &AtomicU8 {
        self.marks
            .get(&addr.as_usize())
            .unwrap_or_else(|| panic!("no mock object at {}", addr))
    }
}

impl MarkablePage for MockPage {
    fn start(&self) -> Address {
        self.start
    }

    fn is_allocating(&self) -> bool {
        false
    }

    fn mark_object(&self, addr: Address, finalizable: bool) -> PageMark {
        let mark = self.mark_word(addr);
        let target = if finalizable {
            MARKED_FINALIZABLE
        } else {
            MARKED_STRONG
        };
        let mut current = mark.load(Ordering::SeqCst);
        loop {
            if current >= target {
                return PageMark::Lost;
            }
            match mark.compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    return PageMark::Won {
                        inc_live: current == UNMARKED,
                    }
                }
                Err(now) => current = now,
            }
        }
    }

    fn inc_live(&self, objects: usize, bytes: usize) {
        self.live_objects.fetch_add(objects, Ordering::SeqCst);
        self.live_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn object_alignment(&self) -> usize {
        BYTES_IN_WORD
    }
}

/// A flat object store standing in for the page table and object model. The
/// marker treats addresses as opaque, so objects and their reference graphs
/// can be scripted without real memory behind them.
pub struct MockHeap {
    objects: BTreeMap<usize, MockObject>,
    pages: Vec<MockPage>,
    roots: Vec<Address>,
}

pub struct MockHeapBuilder {
    objects: BTreeMap<usize, MockObject>,
    roots: Vec<Address>,
    cursor: usize,
}

impl MockHeapBuilder {
    pub fn new() -> Self {
        MockHeapBuilder {
            objects: BTreeMap::new(),
            roots: Vec::new(),
            cursor: MOCK_HEAP_BASE,
        }
    }

    fn place(&mut self, payload_slots: usize, refs: Vec<Address>, is_array: bool) -> Address {
        let addr = Address::from_usize(self.cursor);
        let size = MOCK_OBJECT_HEADER + payload_slots * BYTES_IN_WORD;
        self.cursor += size;
        self.objects
            .insert(addr.as_usize(), MockObject { size, refs, is_array });
        addr
    }

    /// A plain object holding the given references.
    pub fn object(&mut self, refs: Vec<Address>) -> Address {
        let slots = refs.len();
        self.place(slots, refs, false)
    }

    /// A leaf object with no references.
    pub fn leaf(&mut self) -> Address {
        self.place(0, Vec::new(), false)
    }

    /// An object array whose payload is the given reference slots.
    pub fn array(&mut self, refs: Vec<Address>) -> Address {
        let slots = refs.len();
        self.place(slots, refs, true)
    }

    pub fn root(&mut self, addr: Address) {
        self.roots.push(addr);
    }

    pub fn build(self) -> MockHeap {
        let npages = (self.cursor - MOCK_HEAP_BASE + BYTES_IN_PAGE - 1) / BYTES_IN_PAGE;
        let mut pages: Vec<MockPage> = (0..npages.max(1))
            .map(|i| MockPage::new(Address::from_usize(MOCK_HEAP_BASE + i * BYTES_IN_PAGE)))
            .collect();
        for &addr in self.objects.keys() {
            let index = (addr - MOCK_HEAP_BASE) >> LOG_BYTES_IN_PAGE;
            pages[index].marks.insert(addr, AtomicU8::new(UNMARKED));
        }
        MockHeap {
            objects: self.objects,
            pages,
            roots: self.roots,
        }
    }
}

impl Default for MockHeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHeap {
    fn object(&self, addr: Address) -> &MockObject {
        self.objects
            .get(&addr.as_usize())
            .unwrap_or_else(|| panic!("no mock object at {}", addr))
    }

    /// The object containing `addr`, for payload-slice lookups.
    fn containing_object(&self, addr: Address) -> (Address, &MockObject) {
        let (&base, object) = self
            .objects
            .range(..=addr.as_usize())
            .next_back()
            .unwrap_or_else(|| panic!("no mock object containing {}", addr));
        assert!(addr.as_usize() < base + object.size);
        (Address::from_usize(base), object)
    }

    pub fn is_strongly_marked(&self, addr: Address) -> bool {
        self.page_for(addr).mark_word(addr).load(Ordering::SeqCst) == MARKED_STRONG
    }

    pub fn is_marked(&self, addr: Address) -> bool {
        self.page_for(addr).mark_word(addr).load(Ordering::SeqCst) != UNMARKED
    }

    pub fn live_objects(&self) -> usize {
        self.pages
            .iter()
            .map(|p| p.live_objects.load(Ordering::SeqCst))
            .sum()
    }

    pub fn live_bytes(&self) -> usize {
        self.pages
            .iter()
            .map(|p| p.live_bytes.load(Ordering::SeqCst))
            .sum()
    }

    pub fn object_addresses(&self) -> Vec<Address> {
        self.objects.keys().map(|&a| Address::from_usize(a)).collect()
    }
}

impl HeapModel for MockHeap {
    type Page = MockPage;

    fn page_for(&self, addr: Address) -> &MockPage {
        let index = (addr.as_usize() - MOCK_HEAP_BASE) >> LOG_BYTES_IN_PAGE;
        &self.pages[index]
    }

    fn object_size(&self, addr: Address) -> usize {
        self.object(addr).size
    }

    fn is_object_array(&self, addr: Address) -> bool {
        self.object(addr).is_array
    }

    fn object_array_slice(&self, addr: Address) -> (Address, usize) {
        let object = self.object(addr);
        debug_assert!(object.is_array);
        (addr + MOCK_OBJECT_HEADER, object.refs.len() * BYTES_IN_WORD)
    }

    fn scan_object(&self, addr: Address, visitor: &mut dyn FnMut(Address)) {
        let object = self.object(addr);
        debug_assert!(!object.is_array);
        for &reference in &object.refs {
            if !reference.is_zero() {
                visitor(reference);
            }
        }
    }

    fn scan_array_class(&self, _addr: Address, _visitor: &mut dyn FnMut(Address)) {}

    fn scan_slice(&self, addr: Address, nrefs: usize, visitor: &mut dyn FnMut(Address)) {
        let (base, object) = self.containing_object(addr);
        debug_assert!(object.is_array);
        let payload = base + MOCK_OBJECT_HEADER;
        let index = (addr - payload) / BYTES_IN_WORD;
        for &reference in &object.refs[index..index + nrefs] {
            if !reference.is_zero() {
                visitor(reference);
            }
        }
    }

    fn scan_roots(&self, worker_id: u32, nworkers: u32, visitor: &mut dyn FnMut(Address)) {
        for (i, &root) in self.roots.iter().enumerate() {
            if i as u32 % nworkers == worker_id {
                visitor(root);
            }
        }
    }
}

/// Scripted occupancy for director tests.
pub struct MockDirectorHeap {
    snapshot: Mutex<HeapSnapshot>,
}

impl MockDirectorHeap {
    pub fn new(snapshot: HeapSnapshot) -> Self {
        MockDirectorHeap {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: HeapSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

impl DirectorHeap for MockDirectorHeap {
    fn snapshot(&self) -> HeapSnapshot {
        *self.snapshot.lock().unwrap()
    }
}
