//! A GPU resource cache which keeps a working set of geometry and textures
//! resident in small, fixed-size stage and upload buffers, written from
//! scratch the hard way.

mod buffer_allocator;
mod config;
mod device_memory;
mod disk_store;
mod error;
mod free_space_bitmap;
mod image_decoder;
mod memory_properties;
mod object_cache;
mod pretty_wrappers;
mod resource_caches;
mod slot_registry;
mod texture_allocator;
mod transfer_device;
mod use_queue;

pub use self::{
    buffer_allocator::{BufferAllocator, BufferRecord},
    config::CacheConfig,
    disk_store::DiskStore,
    error::CacheError,
    free_space_bitmap::FreeSpaceBitmap,
    image_decoder::{
        DecodedImage, FakeImageDecoder, FileImageDecoder, ImageDecoder,
    },
    memory_properties::MemoryProperties,
    object_cache::{
        FakeObjectFactory, ImageViewCache, ImageViewFactory, ImageViewParams,
        ObjectCache, ObjectFactory, SamplerCache, SamplerFactory,
        SamplerParams,
    },
    resource_caches::{FrameTransfers, ResourceCaches},
    slot_registry::{
        AllocationKey, SlotFlags, WeightedSlotRegistry, MAX_WEIGHT,
    },
    texture_allocator::{TextureAllocator, TextureRecord},
    transfer_device::{
        AshTransferDevice, BufferCopy, FakeImage, FakeTransferDevice,
        ImageBind, ImageCopy, ImageInfo, QueueFamilies, TransferDevice,
        UploadKind,
    },
};
