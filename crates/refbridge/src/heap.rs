//! A minimal non-moving traced heap.
//!
//! [`Heap`] is the collector the bridge is tested against and a usable
//! default for embedders without their own. Objects are fixed-size arrays of
//! reference fields; addresses are handed out monotonically and never
//! reused, and objects never move, so every handle target is trivially
//! pinned.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::{ManagedObject, TracingGc};

const FIRST_ADDR: usize = 0x1000;
const ADDR_STEP: usize = 0x10;

struct HeapInner {
    objects: HashMap<ManagedObject, Vec<Option<ManagedObject>>>,
    roots: HashMap<ManagedObject, usize>,
    next_addr: usize,
}

/// Non-moving mark-sweep heap implementing [`TracingGc`].
///
/// # Example
///
/// ```
/// use refbridge::heap::Heap;
///
/// let heap = Heap::new();
/// let a = heap.allocate(1);
/// let b = heap.allocate(0);
/// heap.set_field(a, 0, Some(b));
///
/// assert_eq!(heap.collect(&[a]), 0);
/// assert_eq!(heap.collect(&[]), 2);
/// assert!(!heap.is_live(b));
/// ```
pub struct Heap {
    inner: Mutex<HeapInner>,
    oom_collections: AtomicUsize,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                objects: HashMap::new(),
                roots: HashMap::new(),
                next_addr: FIRST_ADDR,
            }),
            oom_collections: AtomicUsize::new(0),
        }
    }

    /// Allocates an object with `fields` null reference fields.
    pub fn allocate(&self, fields: usize) -> ManagedObject {
        let mut inner = self.inner.lock();
        let addr = inner.next_addr;
        inner.next_addr += ADDR_STEP;
        let obj = ManagedObject::from_addr(addr)
            .unwrap_or_else(|| unreachable!("heap addresses start above zero"));
        inner.objects.insert(obj, vec![None; fields]);
        obj
    }

    /// Stores `value` into field `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not live or has no such field.
    pub fn set_field(&self, obj: ManagedObject, index: usize, value: Option<ManagedObject>) {
        let mut inner = self.inner.lock();
        let fields = inner
            .objects
            .get_mut(&obj)
            .unwrap_or_else(|| panic!("{obj:?} is not live"));
        fields[index] = value;
    }

    /// Loads field `index` of `obj`. `None` if the field is null or the
    /// object is gone.
    #[must_use]
    pub fn field(&self, obj: ManagedObject, index: usize) -> Option<ManagedObject> {
        self.inner
            .lock()
            .objects
            .get(&obj)
            .and_then(|fields| fields.get(index).copied().flatten())
    }

    /// Returns `true` if `obj` has not been freed.
    #[must_use]
    pub fn is_live(&self, obj: ManagedObject) -> bool {
        self.inner.lock().objects.contains_key(&obj)
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Number of root registrations held on `obj`.
    #[must_use]
    pub fn root_count(&self, obj: ManagedObject) -> usize {
        self.inner.lock().roots.get(&obj).copied().unwrap_or(0)
    }

    /// Root registrations across all objects.
    #[must_use]
    pub fn total_roots(&self) -> usize {
        self.inner.lock().roots.values().sum()
    }

    /// Collections triggered by allocation failures.
    #[must_use]
    pub fn oom_collections(&self) -> usize {
        self.oom_collections.load(Ordering::Relaxed)
    }

    /// Marks from the registered roots plus `extra_roots` and frees the rest.
    /// Returns the number of objects freed.
    pub fn collect(&self, extra_roots: &[ManagedObject]) -> usize {
        let mut inner = self.inner.lock();
        let mut marked = HashSet::with_capacity(inner.objects.len());
        let mut stack: Vec<ManagedObject> = inner
            .roots
            .keys()
            .chain(extra_roots)
            .copied()
            .collect();

        while let Some(obj) = stack.pop() {
            let Some(fields) = inner.objects.get(&obj) else {
                continue;
            };
            if !marked.insert(obj) {
                continue;
            }
            stack.extend(fields.iter().flatten().filter(|f| !marked.contains(*f)));
        }

        let before = inner.objects.len();
        inner.objects.retain(|obj, _| marked.contains(obj));
        before - inner.objects.len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingGc for Heap {
    fn register_root(&self, obj: ManagedObject) {
        *self.inner.lock().roots.entry(obj).or_default() += 1;
    }

    fn unregister_root(&self, obj: ManagedObject) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.roots.get_mut(&obj) {
            *count -= 1;
            if *count == 0 {
                inner.roots.remove(&obj);
            }
        }
    }

    fn on_out_of_memory(&self, _size: usize) {
        self.oom_collections.fetch_add(1, Ordering::Relaxed);
        self.collect(&[]);
    }

    fn roots(&self) -> Vec<(ManagedObject, usize)> {
        self.inner
            .lock()
            .roots
            .iter()
            .map(|(&obj, &count)| (obj, count))
            .collect()
    }

    fn references(&self, obj: ManagedObject) -> Vec<ManagedObject> {
        self.inner
            .lock()
            .objects
            .get(&obj)
            .map(|fields| fields.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    fn reclaim(&self, objects: &[ManagedObject]) {
        let mut inner = self.inner.lock();
        for obj in objects {
            inner.objects.remove(obj);
            inner.roots.remove(obj);
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Heap")
            .field("objects", &inner.objects.len())
            .field("roots", &inner.roots.len())
            .finish_non_exhaustive()
    }
}
