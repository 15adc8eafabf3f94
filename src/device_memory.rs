use {
    crate::{pretty_wrappers::PrettySize, CacheError},
    anyhow::Context,
    ash::vk,
    std::fmt::Debug,
};

/// A block of Vulkan device memory with a host pointer that stays mapped for
/// as long as the memory lives.
pub struct MappedMemory {
    memory: vk::DeviceMemory,
    host_accessible_ptr: *mut u8,
    size_in_bytes: usize,
}

// Public Api
// ----------

impl MappedMemory {
    /// Map the entire memory object.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    /// - the memory must have been allocated with the HOST_VISIBLE property
    /// - ownership of the memory moves to this instance, it must be released
    ///   with [MappedMemory::free]
    pub unsafe fn map(
        device: &ash::Device,
        memory: vk::DeviceMemory,
        size_in_bytes: u64,
    ) -> Result<Self, CacheError> {
        let ptr = device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .with_context(|| "Unable to map the stage memory!")?;
        Ok(Self {
            memory,
            host_accessible_ptr: ptr as *mut u8,
            size_in_bytes: size_in_bytes as usize,
        })
    }

    /// The underlying Vulkan memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// The mapped memory as a byte slice.
    ///
    /// The application must synchronize access. All previously submitted GPU
    /// commands which read the memory must be finished before the host
    /// writes a region they use.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.host_accessible_ptr.is_null() {
            return &mut [];
        }
        unsafe {
            std::slice::from_raw_parts_mut(
                self.host_accessible_ptr,
                self.size_in_bytes,
            )
        }
    }

    /// Unmap and free the memory.
    ///
    /// # Safety
    ///
    /// Unsafe because the memory must not be in use by the device.
    pub unsafe fn free(&mut self, device: &ash::Device) {
        if self.host_accessible_ptr.is_null() {
            return;
        }
        device.unmap_memory(self.memory);
        device.free_memory(self.memory, None);
        self.host_accessible_ptr = std::ptr::null_mut();
        self.memory = vk::DeviceMemory::null();
    }
}

impl Debug for MappedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedMemory")
            .field("memory", &self.memory)
            .field("host_accessible_ptr", &self.host_accessible_ptr)
            .field("size_in_bytes", &PrettySize(self.size_in_bytes as u64))
            .finish()
    }
}
