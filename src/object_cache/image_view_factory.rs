use {
    super::ObjectFactory,
    crate::CacheError,
    anyhow::Context,
    ash::vk,
};

/// The parameters which identify a 2D image view.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ImageViewParams {
    pub image: vk::Image,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
}

/// Creates Vulkan image views.
pub struct ImageViewFactory {
    device: ash::Device,
}

impl ImageViewFactory {
    /// # Safety
    ///
    /// Unsafe because the device must outlive every view created by the
    /// factory.
    pub unsafe fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

impl ObjectFactory for ImageViewFactory {
    type Params = ImageViewParams;
    type Handle = vk::ImageView;

    unsafe fn create(
        &mut self,
        params: &ImageViewParams,
    ) -> Result<vk::ImageView, CacheError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(params.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(params.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: params.aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = self
            .device
            .create_image_view(&create_info, None)
            .with_context(|| {
                format!("Error creating an image view for {:#?}", params)
            })?;
        Ok(view)
    }

    unsafe fn destroy(&mut self, handle: vk::ImageView) {
        self.device.destroy_image_view(handle, None);
    }
}
