use {
    super::ObjectFactory,
    crate::CacheError,
    std::collections::HashSet,
};

/// A fake factory whose objects are plain numbers.
#[derive(Debug, Default)]
pub struct FakeObjectFactory {
    /// The total number of objects created.
    pub created: u64,

    /// Every destroyed handle, in order.
    pub destroyed: Vec<u64>,

    /// Handles which have been created but not destroyed.
    pub live: HashSet<u64>,
}

impl ObjectFactory for FakeObjectFactory {
    type Params = u32;
    type Handle = u64;

    unsafe fn create(&mut self, _params: &u32) -> Result<u64, CacheError> {
        self.created += 1;
        self.live.insert(self.created);
        Ok(self.created)
    }

    unsafe fn destroy(&mut self, handle: u64) {
        self.live.remove(&handle);
        self.destroyed.push(handle);
    }
}
