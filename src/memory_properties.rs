use {
    crate::{
        pretty_wrappers::{PrettyBitflag, PrettySize},
        CacheError,
    },
    ash::vk,
    indoc::indoc,
};

#[derive(Debug, Clone)]
pub struct MemoryProperties {
    types: Vec<vk::MemoryType>,
    heaps: Vec<vk::MemoryHeap>,
}

impl MemoryProperties {
    /// Get the memory properties for the given physical device.
    ///
    /// # Safety
    ///
    /// Unsafe because the physical device must belong to the instance.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties =
            instance.get_physical_device_memory_properties(physical_device);
        Self::from_raw(
            &properties.memory_types[0..properties.memory_type_count as usize],
            &properties.memory_heaps[0..properties.memory_heap_count as usize],
        )
    }

    /// Build memory properties from raw type and heap lists.
    pub fn from_raw(
        types: &[vk::MemoryType],
        heaps: &[vk::MemoryHeap],
    ) -> Self {
        Self {
            types: types.to_vec(),
            heaps: heaps.to_vec(),
        }
    }

    /// Find the first memory type allowed by `type_bits` which has every
    /// requested property.
    pub fn find_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, CacheError> {
        self.types
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                let is_required_type = type_bits & (1 << index) != 0;
                let flags = memory_type.property_flags;
                is_required_type && flags.contains(required)
            })
            .map(|(index, _memory_type)| index as u32)
            .ok_or(CacheError::NoSupportedTypeForProperties(
                PrettyBitflag(type_bits as u64),
                required,
            ))
    }
}

impl std::fmt::Display for MemoryProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            indoc!(
                "
                # Memory Properties

                {} types across {} heaps
                "
            ),
            self.types.len(),
            self.heaps.len(),
        ))?;
        for (index, heap) in self.heaps.iter().enumerate() {
            let types = self
                .types
                .iter()
                .enumerate()
                .filter(|(_, memory_type)| {
                    memory_type.heap_index as usize == index
                })
                .map(|(type_index, memory_type)| {
                    format!("[{}] {:?}", type_index, memory_type.property_flags)
                })
                .collect::<Vec<_>>();
            writeln!(
                f,
                "heap {} ({}, {:?}): {}",
                index,
                PrettySize(heap.size),
                heap.flags,
                types.join(", ")
            )?;
        }
        Ok(())
    }
}
