//! View-slot pools.
//!
//! A view-slot is an entry in a fixed-size, backend-owned table of resource
//! views. There are three tables, one per [`SlotCategory`]:
//!
//! ```text
//! ┌──────────────────────┐  ┌──────────────────────┐  ┌──────────────────────┐
//! │ RenderTarget  (RTV)  │  │ DepthStencil  (DSV)  │  │ ShaderResource (SRV) │
//! │ cpu_base + i*stride  │  │ cpu_base + i*stride  │  │ cpu_base + i*stride  │
//! │                      │  │                      │  │ gpu_base + i*stride  │
//! └──────────────────────┘  └──────────────────────┘  └──────────────────────┘
//! ```
//!
//! Each table is managed by a [`ViewSlotPool`], a free-list allocator with
//! O(1) allocate and release. The free list is a LIFO stack: the most
//! recently released slot is the next one handed out. Capacity is fixed at
//! construction, there is no compaction and no growth.
//!
//! Allocation yields a [`SlotHandle`], a move-only ownership token. The
//! owner must hand it back with [`ViewSlotPool::release`] before the pool is
//! dropped. Leaks are reported when the pool is torn down. In debug builds a
//! per-pool in-use bitmap catches double releases and foreign handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use parking_lot::Mutex;

use crate::error::FrameError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Category of a view-slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotCategory {
    /// Render-target views (color attachments).
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
    /// Shader-resource views (sampled textures).
    ShaderResource,
}

impl SlotCategory {
    /// All categories in table order.
    pub const ALL: [SlotCategory; 3] = [
        SlotCategory::RenderTarget,
        SlotCategory::DepthStencil,
        SlotCategory::ShaderResource,
    ];

    /// Whether views of this category are addressable from shaders.
    pub fn is_shader_visible(self) -> bool {
        matches!(self, Self::ShaderResource)
    }

    pub(crate) fn table_index(self) -> usize {
        match self {
            Self::RenderTarget => 0,
            Self::DepthStencil => 1,
            Self::ShaderResource => 2,
        }
    }
}

impl fmt::Display for SlotCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RenderTarget => write!(f, "render-target"),
            Self::DepthStencil => write!(f, "depth-stencil"),
            Self::ShaderResource => write!(f, "shader-resource"),
        }
    }
}

/// Address layout of a backend view table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewTableLayout {
    /// CPU-visible address of slot 0.
    pub cpu_base: u64,
    /// GPU-visible address of slot 0, for shader-visible tables only.
    pub gpu_base: Option<u64>,
    /// Distance between consecutive slots in bytes.
    pub stride: u32,
}

/// Fixed per-category pool capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotCapacities {
    /// Render-target slots.
    pub render_target: u32,
    /// Depth-stencil slots.
    pub depth_stencil: u32,
    /// Shader-resource slots.
    pub shader_resource: u32,
}

impl Default for SlotCapacities {
    fn default() -> Self {
        Self {
            render_target: 16,
            depth_stencil: 4,
            shader_resource: 64,
        }
    }
}

impl SlotCapacities {
    /// Capacity for one category.
    pub fn get(&self, category: SlotCategory) -> u32 {
        match category {
            SlotCategory::RenderTarget => self.render_target,
            SlotCategory::DepthStencil => self.depth_stencil,
            SlotCategory::ShaderResource => self.shader_resource,
        }
    }
}

/// Copyable description of an allocated view-slot.
///
/// This is what commands and effects pass around. It does not own the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewHandle {
    category: SlotCategory,
    index: u32,
    cpu_address: u64,
    gpu_address: Option<u64>,
}

impl ViewHandle {
    /// Table this view lives in.
    pub fn category(&self) -> SlotCategory {
        self.category
    }

    /// Pool-relative slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// CPU-visible address of the slot.
    pub fn cpu_address(&self) -> u64 {
        self.cpu_address
    }

    /// GPU-visible address, present only for shader-resource views.
    pub fn gpu_address(&self) -> Option<u64> {
        self.gpu_address
    }
}

/// Ownership token for an allocated view-slot.
///
/// Not `Clone`: exactly one owner exists per live slot.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a slot handle must be released back to its pool"]
pub struct SlotHandle {
    view: ViewHandle,
    pool_id: u64,
}

impl SlotHandle {
    /// The view this handle owns.
    pub fn view(&self) -> ViewHandle {
        self.view
    }

    /// Pool-relative slot index.
    pub fn index(&self) -> u32 {
        self.view.index
    }

    /// Table this slot lives in.
    pub fn category(&self) -> SlotCategory {
        self.view.category
    }
}

/// Fixed-capacity free-list allocator for one slot category.
pub struct ViewSlotPool {
    id: u64,
    category: SlotCategory,
    capacity: u32,
    layout: ViewTableLayout,
    /// Free slot indices; the top of the stack is allocated next.
    free: Vec<u32>,
    #[cfg(debug_assertions)]
    in_use: FixedBitSet,
}

impl ViewSlotPool {
    /// Create a pool over a table of `capacity` slots.
    pub fn new(category: SlotCategory, capacity: u32, layout: ViewTableLayout) -> Self {
        debug_assert!(
            layout.gpu_base.is_none() || category.is_shader_visible(),
            "only shader-resource tables have GPU-visible addresses"
        );
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            category,
            capacity,
            layout,
            free: (0..capacity).rev().collect(),
            #[cfg(debug_assertions)]
            in_use: FixedBitSet::with_capacity(capacity as usize),
        }
    }

    /// Category served by this pool.
    pub fn category(&self) -> SlotCategory {
        self.category
    }

    /// Fixed number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots currently on the free list.
    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Number of slots currently owned by clients.
    pub fn in_use_count(&self) -> u32 {
        self.capacity - self.free_count()
    }

    /// Take a slot from the free list.
    pub fn allocate(&mut self) -> Result<SlotHandle, FrameError> {
        let Some(index) = self.free.pop() else {
            log::debug!(
                "{} pool exhausted ({} slots)",
                self.category,
                self.capacity
            );
            return Err(FrameError::SlotExhausted {
                category: self.category,
                capacity: self.capacity,
            });
        };

        #[cfg(debug_assertions)]
        {
            debug_assert!(
                !self.in_use.contains(index as usize),
                "{} slot {index} was on the free list while in use",
                self.category
            );
            self.in_use.insert(index as usize);
        }

        let stride = u64::from(self.layout.stride);
        let offset = u64::from(index) * stride;
        Ok(SlotHandle {
            view: ViewHandle {
                category: self.category,
                index,
                cpu_address: self.layout.cpu_base + offset,
                gpu_address: self.layout.gpu_base.map(|base| base + offset),
            },
            pool_id: self.id,
        })
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: SlotHandle) {
        debug_assert_eq!(
            slot.pool_id, self.id,
            "{} slot {} released into a foreign pool",
            self.category, slot.view.index
        );
        debug_assert!(slot.view.index < self.capacity);

        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.in_use.contains(slot.view.index as usize),
                "{} slot {} released twice or never allocated",
                self.category,
                slot.view.index
            );
            self.in_use.set(slot.view.index as usize, false);
        }

        self.free.push(slot.view.index);
    }
}

impl fmt::Debug for ViewSlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSlotPool")
            .field("category", &self.category)
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

impl Drop for ViewSlotPool {
    fn drop(&mut self) {
        let leaked = self.in_use_count();
        if leaked == 0 {
            return;
        }
        log::error!(
            "{} pool destroyed with {leaked} slot(s) still allocated",
            self.category
        );
        if !std::thread::panicking() {
            debug_assert_eq!(leaked, 0, "{} slots leaked", self.category);
        }
    }
}

/// Usage snapshot of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPoolStats {
    /// Fixed number of slots.
    pub capacity: u32,
    /// Slots currently owned by clients.
    pub in_use: u32,
}

/// The three view-slot pools of a device.
///
/// Shared by reference between the components that own views. Each pool is
/// behind its own lock so categories never contend with each other.
pub struct ViewSlotAllocator {
    pools: [Mutex<ViewSlotPool>; 3],
}

impl ViewSlotAllocator {
    /// Create the pools with the given capacities and table layouts.
    pub fn new(capacities: SlotCapacities, layouts: [ViewTableLayout; 3]) -> Self {
        let pools = SlotCategory::ALL.map(|category| {
            Mutex::new(ViewSlotPool::new(
                category,
                capacities.get(category),
                layouts[category.table_index()],
            ))
        });
        Self { pools }
    }

    /// Allocate a slot from the category's pool.
    pub fn allocate(&self, category: SlotCategory) -> Result<SlotHandle, FrameError> {
        self.pools[category.table_index()].lock().allocate()
    }

    /// Release a slot back to its pool.
    pub fn release(&self, slot: SlotHandle) {
        self.pools[slot.category().table_index()]
            .lock()
            .release(slot);
    }

    /// Usage snapshot of one pool.
    pub fn stats(&self, category: SlotCategory) -> SlotPoolStats {
        let pool = self.pools[category.table_index()].lock();
        SlotPoolStats {
            capacity: pool.capacity(),
            in_use: pool.in_use_count(),
        }
    }
}

impl fmt::Debug for ViewSlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.pools.iter().map(|pool| pool.lock().in_use_count()))
            .finish()
    }
}

static_assertions::assert_impl_all!(ViewSlotAllocator: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    fn layout(category: SlotCategory) -> ViewTableLayout {
        ViewTableLayout {
            cpu_base: 0x1000,
            gpu_base: category.is_shader_visible().then_some(0x8000_0000),
            stride: 32,
        }
    }

    fn pool(category: SlotCategory, capacity: u32) -> ViewSlotPool {
        ViewSlotPool::new(category, capacity, layout(category))
    }

    fn release_all(pool: &mut ViewSlotPool, slots: Vec<SlotHandle>) {
        for slot in slots {
            pool.release(slot);
        }
    }

    #[test]
    fn test_first_allocations_are_sequential() {
        let mut pool = pool(SlotCategory::RenderTarget, 4);
        let slots: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        let indices: Vec<u32> = slots.iter().map(SlotHandle::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        release_all(&mut pool, slots);
    }

    #[test]
    fn test_released_slot_is_reused_lifo() {
        let mut pool = pool(SlotCategory::ShaderResource, 8);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let released_index = b.index();
        pool.release(b);

        let d = pool.allocate().unwrap();
        assert_eq!(d.index(), released_index);

        release_all(&mut pool, vec![a, c, d]);
    }

    #[rstest]
    #[case::render_target(SlotCategory::RenderTarget)]
    #[case::depth_stencil(SlotCategory::DepthStencil)]
    #[case::shader_resource(SlotCategory::ShaderResource)]
    fn test_exhaustion_and_round_trip(#[case] category: SlotCategory) {
        let capacity = 5;
        let mut pool = pool(category, capacity);

        let slots: Vec<_> = (0..capacity).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(
            pool.allocate(),
            Err(FrameError::SlotExhausted { category, capacity })
        );
        release_all(&mut pool, slots);
        assert_eq!(pool.free_count(), capacity);

        let again: Vec<_> = (0..capacity).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.in_use_count(), capacity);
        release_all(&mut pool, again);
    }

    #[test]
    fn test_never_hands_out_live_slot_twice() {
        let capacity = 16;
        let mut pool = pool(SlotCategory::ShaderResource, capacity);
        let mut live: Vec<SlotHandle> = Vec::new();
        let mut state: u32 = 0x2545_f491;

        for _ in 0..2000 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let release = (state >> 16) % 3 == 0;
            if release && !live.is_empty() {
                let victim = (state as usize) % live.len();
                pool.release(live.swap_remove(victim));
            } else if let Ok(slot) = pool.allocate() {
                live.push(slot);
            } else {
                assert_eq!(live.len() as u32, capacity);
            }

            let unique: HashSet<u32> = live.iter().map(SlotHandle::index).collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(pool.in_use_count() as usize, live.len());
        }

        release_all(&mut pool, live);
    }

    #[test]
    fn test_addresses_follow_table_layout() {
        let mut srv = pool(SlotCategory::ShaderResource, 4);
        let mut dsv = pool(SlotCategory::DepthStencil, 4);

        let first = srv.allocate().unwrap();
        let second = srv.allocate().unwrap();
        assert_eq!(second.view().cpu_address(), 0x1000 + 32);
        assert_eq!(second.view().gpu_address(), Some(0x8000_0000 + 32));

        let depth = dsv.allocate().unwrap();
        assert_eq!(depth.view().cpu_address(), 0x1000);
        assert_eq!(depth.view().gpu_address(), None);

        release_all(&mut srv, vec![first, second]);
        dsv.release(depth);
    }

    #[test]
    fn test_allocator_routes_by_category() {
        let allocator = ViewSlotAllocator::new(
            SlotCapacities {
                render_target: 2,
                depth_stencil: 1,
                shader_resource: 3,
            },
            SlotCategory::ALL.map(layout),
        );

        let rtv = allocator.allocate(SlotCategory::RenderTarget).unwrap();
        let dsv = allocator.allocate(SlotCategory::DepthStencil).unwrap();
        assert!(matches!(
            allocator.allocate(SlotCategory::DepthStencil),
            Err(FrameError::SlotExhausted { capacity: 1, .. })
        ));
        assert_eq!(
            allocator.stats(SlotCategory::RenderTarget),
            SlotPoolStats {
                capacity: 2,
                in_use: 1
            }
        );
        assert_eq!(allocator.stats(SlotCategory::ShaderResource).in_use, 0);

        allocator.release(rtv);
        allocator.release(dsv);
        assert_eq!(allocator.stats(SlotCategory::DepthStencil).in_use, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "released twice or never allocated")]
    fn test_double_release_is_caught() {
        let mut pool = pool(SlotCategory::RenderTarget, 2);
        let slot = pool.allocate().unwrap();
        let forged = SlotHandle {
            view: slot.view,
            pool_id: slot.pool_id,
        };
        pool.release(slot);
        pool.release(forged);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "released into a foreign pool")]
    fn test_foreign_release_is_caught() {
        let mut first = pool(SlotCategory::RenderTarget, 2);
        let mut second = pool(SlotCategory::RenderTarget, 2);
        let slot = first.allocate().unwrap();
        second.release(slot);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "slots leaked")]
    fn test_leak_detected_on_teardown() {
        let mut pool = pool(SlotCategory::DepthStencil, 2);
        let slot = pool.allocate().unwrap();
        std::mem::forget(slot);
        drop(pool);
    }
}
