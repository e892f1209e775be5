// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of hardware frame buffers shared between the decoder and its
//! downstream consumers.
//!
//! Surfaces are handed out as cheaply clonable [`SurfaceProxy`] references.
//! A surface only becomes available again once the last proxy clone has been
//! dropped *and* the hardware's lock flag for it has cleared; until then it
//! sits on a released list waiting for reclamation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

use crate::backend::FrameInfo;
use crate::backend::SurfaceAllocator;
use crate::backend::SurfaceId;
use crate::CropRect;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no free surface and the pool is at capacity")]
    Exhausted,
    #[error("surface {0} was never allocated by this pool")]
    UnknownSurface(SurfaceId),
    #[error("surface allocation failed")]
    Alloc(#[source] anyhow::Error),
}

/// One hardware frame buffer. The pool exclusively owns its hardware
/// lifetime.
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    info: FrameInfo,
}

impl Surface {
    pub fn new(id: SurfaceId, info: FrameInfo) -> Self {
        Self { id, info }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn crop(&self) -> CropRect {
        self.info.crop
    }
}

struct ProxyInner {
    /// `Some` until the proxy is dropped.
    surface: Option<Surface>,
    pool: Weak<SurfacePool>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        // `unwrap` cannot fail here, `surface` is `Some` until this point.
        let surface = self.surface.take().unwrap();

        if let Some(pool) = self.pool.upgrade() {
            pool.release(surface);
        } else {
            log::debug!("dropping surface {} after its pool", surface.id());
        }
    }
}

/// Shared reference to a pooled surface.
///
/// The surface returns to its pool's released list when the last clone is
/// dropped. It becomes reusable once the hardware lock flag has also cleared.
pub struct SurfaceProxy(Arc<ProxyInner>);

impl Clone for SurfaceProxy {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl SurfaceProxy {
    pub fn surface(&self) -> &Surface {
        // `unwrap` cannot fail, `surface` is `Some` until the inner value is
        // dropped.
        self.0.surface.as_ref().unwrap()
    }

    pub fn id(&self) -> SurfaceId {
        self.surface().id()
    }
}

#[derive(Default)]
struct PoolInner {
    free: VecDeque<Surface>,
    /// Surfaces currently referenced by callers.
    used: Vec<Weak<ProxyInner>>,
    /// Surfaces whose last reference was dropped but whose hardware lock
    /// flag may still be set.
    released: Vec<Surface>,
    /// Soft bound on concurrently held surfaces. 0 means unbounded.
    capacity: usize,
}

impl PoolInner {
    fn held_count(&self) -> usize {
        self.used.iter().filter(|w| w.strong_count() > 0).count() + self.released.len()
    }
}

/// Bounded (or unbounded) set of hardware frame buffers.
///
/// All list bookkeeping happens under a single mutex so sessions sharing one
/// device can share a pool. The hardware lock-flag reads happen outside the
/// critical section.
pub struct SurfacePool {
    allocator: Box<dyn SurfaceAllocator>,
    info: FrameInfo,
    inner: Mutex<PoolInner>,
}

impl SurfacePool {
    pub fn new(allocator: Box<dyn SurfaceAllocator>, info: FrameInfo) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            info,
            inner: Mutex::new(Default::default()),
        })
    }

    pub fn with_capacity(
        allocator: Box<dyn SurfaceAllocator>,
        info: FrameInfo,
        capacity: usize,
    ) -> Arc<Self> {
        let pool = Self::new(allocator, info);
        pool.set_capacity(capacity);
        pool
    }

    /// Hands out a free surface, reclaiming unlocked released surfaces
    /// first and allocating a new one if the pool is below capacity.
    pub fn acquire(self: &Arc<Self>) -> Result<SurfaceProxy, PoolError> {
        self.reclaim();

        let mut inner = self.inner.lock().unwrap();

        if inner.capacity != 0 && inner.held_count() >= inner.capacity {
            return Err(PoolError::Exhausted);
        }

        if let Some(surface) = inner.free.pop_front() {
            return Ok(Self::lease(self, &mut inner, surface));
        }

        // Allocation is a hardware call; do it without holding the lock.
        drop(inner);
        let surface = self.allocator.alloc(&self.info).map_err(PoolError::Alloc)?;
        log::debug!("allocated surface {} for pool", surface.id());

        let mut inner = self.inner.lock().unwrap();
        Ok(Self::lease(self, &mut inner, surface))
    }

    /// Finds the surface backing the raw handle the hardware reported as
    /// holding a decoded picture.
    ///
    /// The handle may belong to a surface whose last caller reference is
    /// already gone: the hardware's reference-picture buffering can report
    /// an older, still-locked surface as output. Such a surface is
    /// re-leased off the released list.
    ///
    /// Failure means the hardware returned a handle this pool never
    /// allocated, which callers treat as an internal-consistency fatal
    /// error.
    pub fn find_by_id(self: &Arc<Self>, id: SurfaceId) -> Result<SurfaceProxy, PoolError> {
        // Upgraded references must not be dropped while holding the lock:
        // a proxy drop re-enters `release`.
        let candidates: Vec<Arc<ProxyInner>> = {
            let inner = self.inner.lock().unwrap();
            inner.used.iter().filter_map(Weak::upgrade).collect()
        };

        if let Some(found) = candidates
            .into_iter()
            .find(|p| p.surface.as_ref().map(Surface::id) == Some(id))
        {
            return Ok(SurfaceProxy(found));
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.released.iter().position(|s| s.id() == id) {
            let surface = inner.released.swap_remove(pos);
            return Ok(Self::lease(self, &mut inner, surface));
        }

        Err(PoolError::UnknownSurface(id))
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().unwrap().capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Number of surfaces immediately available without reclamation or
    /// allocation.
    pub fn num_free(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Number of surfaces currently held by callers or awaiting hardware
    /// unlock.
    pub fn num_held(&self) -> usize {
        self.inner.lock().unwrap().held_count()
    }

    /// Moves released surfaces whose hardware lock flag has cleared back to
    /// the free list.
    fn reclaim(&self) {
        let released_ids: Vec<SurfaceId> = {
            let inner = self.inner.lock().unwrap();
            inner.released.iter().map(Surface::id).collect()
        };

        if released_ids.is_empty() {
            return;
        }

        // Lock-flag reads are hardware status queries; keep them outside the
        // critical section.
        let unlocked: Vec<SurfaceId> = released_ids
            .into_iter()
            .filter(|id| !self.allocator.is_locked(*id))
            .collect();

        let mut inner = self.inner.lock().unwrap();
        let mut i = 0;
        while i < inner.released.len() {
            if unlocked.contains(&inner.released[i].id()) {
                let surface = inner.released.swap_remove(i);
                log::debug!("reclaimed surface {}", surface.id());
                inner.free.push_back(surface);
            } else {
                i += 1;
            }
        }
    }

    fn lease(self: &Arc<Self>, inner: &mut PoolInner, surface: Surface) -> SurfaceProxy {
        let proxy = Arc::new(ProxyInner {
            surface: Some(surface),
            pool: Arc::downgrade(self),
        });
        inner.used.push(Arc::downgrade(&proxy));
        SurfaceProxy(proxy)
    }

    /// Called from proxy drop: the caller side is done with `surface`, but
    /// the hardware may still hold it.
    fn release(&self, surface: Surface) {
        let mut inner = self.inner.lock().unwrap();
        inner.used.retain(|w| w.strong_count() > 0);
        inner.released.push(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;

    fn pool_with_fake() -> (Arc<SurfacePool>, Arc<DummyAllocator>) {
        let allocator = DummyAllocator::new();
        let pool = SurfacePool::new(Box::new(Arc::clone(&allocator)), FrameInfo::default());
        (pool, allocator)
    }

    #[test]
    fn acquire_never_hands_out_a_held_surface() {
        let (pool, _) = pool_with_fake();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.num_held(), 2);
    }

    #[test]
    fn capacity_of_one_exhausts_then_recovers() {
        let (pool, allocator) = pool_with_fake();
        pool.set_capacity(1);

        let first = pool.acquire().unwrap();
        let first_id = first.id();
        allocator.set_locked(first_id, true);

        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));

        // Dropping the caller reference alone is not enough while the
        // hardware lock flag is set.
        drop(first);
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));

        allocator.set_locked(first_id, false);
        let third = pool.acquire().unwrap();
        // Reuse, not a fresh allocation.
        assert_eq!(third.id(), first_id);
    }

    #[test]
    fn unlocked_release_is_reused() {
        let (pool, _) = pool_with_fake();

        let a = pool.acquire().unwrap();
        let a_id = a.id();
        drop(a);

        let b = pool.acquire().unwrap();
        assert_eq!(b.id(), a_id);
    }

    #[test]
    fn find_by_id_is_left_inverse_of_acquire() {
        let (pool, _) = pool_with_fake();

        let a = pool.acquire().unwrap();
        let found = pool.find_by_id(a.id()).unwrap();
        assert_eq!(found.id(), a.id());

        // Both proxies refer to the same logical entry.
        drop(found);
        assert_eq!(pool.num_held(), 1);
    }

    #[test]
    fn released_surface_still_held_by_hardware_is_found() {
        let (pool, allocator) = pool_with_fake();

        let a = pool.acquire().unwrap();
        let a_id = a.id();
        allocator.set_locked(a_id, true);
        drop(a);

        // The hardware can report this surface as decode output after the
        // caller's last reference is gone.
        let found = pool.find_by_id(a_id).unwrap();
        assert_eq!(found.id(), a_id);
        assert_eq!(pool.num_held(), 1);

        // The re-leased surface is in use again and must not be handed out.
        let b = pool.acquire().unwrap();
        assert_ne!(b.id(), a_id);
    }

    #[test]
    fn find_by_id_rejects_foreign_handles() {
        let (pool, _) = pool_with_fake();
        let _a = pool.acquire().unwrap();

        assert!(matches!(
            pool.find_by_id(9999),
            Err(PoolError::UnknownSurface(9999))
        ));
    }

    #[test]
    fn clone_extends_lifetime() {
        let (pool, _) = pool_with_fake();

        let a = pool.acquire().unwrap();
        let a_id = a.id();
        let downstream = a.clone();
        drop(a);

        // Still held by the clone; must not be reused.
        let b = pool.acquire().unwrap();
        assert_ne!(b.id(), a_id);

        drop(downstream);
        drop(b);
        assert_eq!(pool.num_free(), 0); // not reclaimed until next acquire
        let c = pool.acquire().unwrap();
        assert!(c.id() == a_id || pool.num_free() >= 1);
    }

    #[test]
    fn proxy_outliving_pool_drops_cleanly() {
        let (pool, _) = pool_with_fake();
        let a = pool.acquire().unwrap();
        drop(pool);
        drop(a);
    }
}
