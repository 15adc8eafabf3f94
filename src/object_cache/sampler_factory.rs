use {
    super::ObjectFactory,
    crate::CacheError,
    anyhow::Context,
    ash::vk,
};

/// The parameters which identify a sampler.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SamplerParams {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,

    /// Anisotropic filtering is disabled when this is 1 or less.
    pub max_anisotropy: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: 1,
        }
    }
}

/// Creates Vulkan samplers.
pub struct SamplerFactory {
    device: ash::Device,
}

impl SamplerFactory {
    /// # Safety
    ///
    /// Unsafe because the device must outlive every sampler created by the
    /// factory.
    pub unsafe fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

impl ObjectFactory for SamplerFactory {
    type Params = SamplerParams;
    type Handle = vk::Sampler;

    unsafe fn create(
        &mut self,
        params: &SamplerParams,
    ) -> Result<vk::Sampler, CacheError> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(params.mag_filter)
            .min_filter(params.min_filter)
            .mipmap_mode(params.mipmap_mode)
            .address_mode_u(params.address_mode)
            .address_mode_v(params.address_mode)
            .address_mode_w(params.address_mode)
            .anisotropy_enable(params.max_anisotropy > 1)
            .max_anisotropy(params.max_anisotropy.max(1) as f32)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = self
            .device
            .create_sampler(&create_info, None)
            .with_context(|| {
                format!("Error creating a sampler for {:#?}", params)
            })?;
        Ok(sampler)
    }

    unsafe fn destroy(&mut self, handle: vk::Sampler) {
        self.device.destroy_sampler(handle, None);
    }
}
