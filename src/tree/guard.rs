use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{BufferManager, Page, PageId};
use crate::latch::{LatchResult, Restart};
use crate::tree::node::Node;

// The lock guards below borrow from the latch inside the co-owned
// `Arc<Page>`, so their lifetime is erased; every guard type drops the lock
// half strictly before the Arc.

fn erase_read(guard: RwLockReadGuard<'_, Node>) -> RwLockReadGuard<'static, Node> {
    unsafe { mem::transmute::<RwLockReadGuard<'_, Node>, RwLockReadGuard<'static, Node>>(guard) }
}

fn erase_write(guard: RwLockWriteGuard<'_, Node>) -> RwLockWriteGuard<'static, Node> {
    unsafe { mem::transmute::<RwLockWriteGuard<'_, Node>, RwLockWriteGuard<'static, Node>>(guard) }
}

/// Optimistic page guard: non-blocking acquisition pinned to the latch
/// version observed at entry. Conflicting writers surface as [`Restart`].
pub struct OptimisticPageGuard {
    guard: ManuallyDrop<RwLockReadGuard<'static, Node>>,
    page: Arc<Page>,
    version: u64,
}

impl OptimisticPageGuard {
    pub fn latch(page: Arc<Page>) -> LatchResult<Self> {
        let raw = page.latch().try_read()?;
        let guard = ManuallyDrop::new(erase_read(raw));
        let version = page.latch().version();
        Ok(Self {
            guard,
            page,
            version,
        })
    }

    /// Acquire only if the latch still carries `expected`. Backs the
    /// dangling-pointer fast path of garbage collection.
    pub fn latch_pinned(page: Arc<Page>, expected: u64) -> LatchResult<Self> {
        let guard = Self::latch(page)?;
        if guard.version != expected {
            return Err(Restart);
        }
        Ok(guard)
    }

    /// Lock coupling: resolve and latch a child, then validate this guard
    /// once more so a stale descent cannot continue.
    pub fn couple_child(
        &self,
        buffer: &BufferManager,
        child: PageId,
    ) -> LatchResult<OptimisticPageGuard> {
        let child_page = buffer.try_fetch(child).ok_or(Restart)?;
        let child_guard = Self::latch(child_page)?;
        self.recheck()?;
        Ok(child_guard)
    }

    pub fn node(&self) -> &Node {
        &self.guard
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn recheck(&self) -> LatchResult<()> {
        self.page.latch().validate(self.version)
    }

    /// Release without validation.
    pub fn kill(self) {}

    fn into_page(mut self) -> (Arc<Page>, u64) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            let page = ptr::read(&self.page);
            let version = self.version;
            mem::forget(self);
            (page, version)
        }
    }

    /// Upgrade to exclusive. Fails with [`Restart`] when another latch
    /// holder is active or the version moved while the read half was
    /// re-acquired as a write half.
    pub fn upgrade(self) -> LatchResult<ExclusivePageGuard> {
        let (page, version) = self.into_page();
        let raw = match page.latch().try_write() {
            Ok(raw) => raw,
            Err(_) => return Err(Restart),
        };
        if page.latch().version() != version {
            drop(raw);
            return Err(Restart);
        }
        let guard = ManuallyDrop::new(erase_write(raw));
        page.latch().mark_locked();
        Ok(ExclusivePageGuard { guard, page })
    }

    pub fn into_shared(mut self) -> SharedPageGuard {
        unsafe {
            let guard = ManuallyDrop::take(&mut self.guard);
            let page = ptr::read(&self.page);
            mem::forget(self);
            SharedPageGuard {
                guard: ManuallyDrop::new(guard),
                page,
            }
        }
    }
}

impl Drop for OptimisticPageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

/// Shared page guard: blocking reader that coexists with optimistic
/// readers and excludes writers for its whole lifetime.
pub struct SharedPageGuard {
    guard: ManuallyDrop<RwLockReadGuard<'static, Node>>,
    page: Arc<Page>,
}

impl SharedPageGuard {
    pub fn latch(page: Arc<Page>) -> Self {
        let raw = page.latch().read();
        let guard = ManuallyDrop::new(erase_read(raw));
        Self { guard, page }
    }

    pub fn node(&self) -> &Node {
        &self.guard
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn upgrade(mut self) -> LatchResult<ExclusivePageGuard> {
        // Observe the version while the read half still excludes writers,
        // so anything that slips in before the write half is detected.
        let version = self.page.latch().version();
        let (page, version) = unsafe {
            ManuallyDrop::drop(&mut self.guard);
            let page = ptr::read(&self.page);
            mem::forget(self);
            (page, version)
        };
        let raw = match page.latch().try_write() {
            Ok(raw) => raw,
            Err(_) => return Err(Restart),
        };
        if page.latch().version() != version {
            drop(raw);
            return Err(Restart);
        }
        let guard = ManuallyDrop::new(erase_write(raw));
        page.latch().mark_locked();
        Ok(ExclusivePageGuard { guard, page })
    }
}

impl Drop for SharedPageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

/// Exclusive page guard. The latch version is odd for its whole lifetime;
/// dropping it publishes a fresh even version, invalidating every
/// optimistic observation made before or during the hold.
pub struct ExclusivePageGuard {
    guard: ManuallyDrop<RwLockWriteGuard<'static, Node>>,
    page: Arc<Page>,
}

impl ExclusivePageGuard {
    pub fn latch(page: Arc<Page>) -> Self {
        let raw = page.latch().write();
        let guard = ManuallyDrop::new(erase_write(raw));
        page.latch().mark_locked();
        Self { guard, page }
    }

    pub fn node(&self) -> &Node {
        &self.guard
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.guard
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn mark_dirty(&self) {
        self.page.mark_dirty();
    }

    /// The version the latch will publish when this guard releases; the
    /// dangling-pointer fast path pins on it.
    pub fn version_after_release(&self) -> u64 {
        self.page.latch().version_after_release()
    }

    pub fn downgrade(self) -> SharedPageGuard {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            let guard = ManuallyDrop::take(&mut this.guard);
            let page = ptr::read(&this.page);
            page.latch().mark_released();
            let read = RwLockWriteGuard::downgrade(guard);
            SharedPageGuard {
                guard: ManuallyDrop::new(read),
                page,
            }
        }
    }

    /// Unregister the page and release the latch. Descents still holding
    /// the page id fail to resolve it and restart.
    pub fn reclaim(self, buffer: &BufferManager) {
        buffer.reclaim_page(self.page.id());
    }
}

impl Drop for ExclusivePageGuard {
    fn drop(&mut self) {
        self.page.latch().mark_released();
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}
