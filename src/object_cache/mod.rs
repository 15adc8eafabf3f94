//! Weighted caches of small reusable graphics objects such as samplers and
//! image views.
//!
//! Objects are looked up by their creation parameters. When the cache is full
//! the lowest weight object which nobody is using is destroyed to make room.

mod fake_object_factory;
mod image_view_factory;
mod sampler_factory;

use {
    crate::{
        use_queue::{HIT_WEIGHT_DECAY, HIT_WEIGHT_INCREMENT},
        AllocationKey, CacheError, SlotFlags, WeightedSlotRegistry,
    },
    anyhow::anyhow,
    rustc_hash::FxHashMap,
    std::{fmt::Debug, hash::Hash},
};

pub use self::{
    fake_object_factory::FakeObjectFactory,
    image_view_factory::{ImageViewFactory, ImageViewParams},
    sampler_factory::{SamplerFactory, SamplerParams},
};

/// Samplers keyed by their filtering and addressing parameters.
pub type SamplerCache = ObjectCache<SamplerFactory>;

/// Image views keyed by image, format and aspect.
pub type ImageViewCache = ObjectCache<ImageViewFactory>;

/// Creates and destroys the objects held by an [ObjectCache].
pub trait ObjectFactory {
    type Params: Hash + Eq + Clone + Debug;
    type Handle: Hash + Eq + Copy + Debug;

    /// # Safety
    ///
    /// Unsafe because the object must be destroyed with
    /// [ObjectFactory::destroy].
    unsafe fn create(
        &mut self,
        params: &Self::Params,
    ) -> Result<Self::Handle, CacheError>;

    /// # Safety
    ///
    /// Unsafe because the object must not be in use by the device.
    unsafe fn destroy(&mut self, handle: Self::Handle);
}

#[derive(Debug)]
struct CachedObject<P, H> {
    params: P,
    handle: H,
    use_count: u32,
}

pub struct ObjectCache<F: ObjectFactory> {
    factory: F,
    registry: WeightedSlotRegistry<CachedObject<F::Params, F::Handle>>,
    keys_by_params: FxHashMap<F::Params, AllocationKey>,
    keys_by_handle: FxHashMap<F::Handle, AllocationKey>,
}

// Public API
// ----------

impl<F: ObjectFactory> ObjectCache<F> {
    /// Create a cache which holds at most capacity objects.
    pub fn new(factory: F, capacity: usize) -> Self {
        Self {
            factory,
            registry: WeightedSlotRegistry::new(capacity),
            keys_by_params: FxHashMap::default(),
            keys_by_handle: FxHashMap::default(),
        }
    }

    /// Get the object for params, creating it when needed.
    ///
    /// Every successful call counts as one use of the object. Hand the object
    /// back with [ObjectCache::release] once it is no longer needed.
    ///
    /// # Returns
    ///
    /// * Err(AllocatorFull): the cache is full and every object is in use.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - creating an object may destroy the least valuable unused object,
    ///     which must no longer be referenced by executing commands
    pub unsafe fn get_or_create(
        &mut self,
        params: &F::Params,
    ) -> Result<F::Handle, CacheError> {
        if let Some(&key) = self.keys_by_params.get(params) {
            let slot =
                self.registry
                    .bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
            let object = self.registry.record_mut(slot);
            object.use_count += 1;
            return Ok(object.handle);
        }

        if !self.registry.is_full() {
            let handle = self.factory.create(params)?;
            let key = self.registry.push(CachedObject {
                params: params.clone(),
                handle,
                use_count: 1,
            })?;
            self.registry
                .bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
            self.keys_by_params.insert(params.clone(), key);
            self.keys_by_handle.insert(handle, key);
            log::trace!("Created {:?} for {:?}", handle, params);
            return Ok(handle);
        }

        let slot = self
            .registry
            .lowest_first(SlotFlags::empty(), SlotFlags::empty())
            .find(|&slot| self.registry.record(slot).use_count == 0)
            .ok_or(CacheError::AllocatorFull)?;
        let key = self.registry.key(slot);
        let handle = self.factory.create(params)?;

        let evicted = std::mem::replace(
            self.registry.record_mut(slot),
            CachedObject {
                params: params.clone(),
                handle,
                use_count: 1,
            },
        );
        self.factory.destroy(evicted.handle);
        self.keys_by_params.remove(&evicted.params);
        self.keys_by_handle.remove(&evicted.handle);
        log::debug!(
            "Replaced {:?} with {:?} for {:?}",
            evicted.handle,
            handle,
            params
        );

        self.keys_by_params.insert(params.clone(), key);
        self.keys_by_handle.insert(handle, key);
        self.registry.demote(key);
        self.registry
            .bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
        Ok(handle)
    }

    /// Give up one use of handle. Objects without uses can be evicted.
    pub fn release(&mut self, handle: F::Handle) -> Result<(), CacheError> {
        let slot = self
            .keys_by_handle
            .get(&handle)
            .and_then(|&key| self.registry.slot(key))
            .ok_or_else(|| anyhow!("{:?} is not in the cache", handle))?;
        let object = self.registry.record_mut(slot);
        if object.use_count == 0 {
            return Err(CacheError::RuntimeError(anyhow!(
                "{:?} was released more often than it was requested",
                handle
            )));
        }
        object.use_count -= 1;
        Ok(())
    }

    /// The number of outstanding uses of handle.
    pub fn use_count(&self, handle: F::Handle) -> Option<u32> {
        self.keys_by_handle
            .get(&handle)
            .and_then(|&key| self.registry.slot(key))
            .map(|slot| self.registry.record(slot).use_count)
    }

    pub fn contains(&self, params: &F::Params) -> bool {
        self.keys_by_params.contains_key(params)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Destroy every cached object.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - none of the objects may be in use by the device
    ///   - no method may be called afterwards
    pub unsafe fn destroy(&mut self) {
        log::debug!("Destroying {} cached objects", self.keys_by_handle.len());
        for (handle, _key) in self.keys_by_handle.drain() {
            self.factory.destroy(handle);
        }
        self.keys_by_params.clear();
    }
}
