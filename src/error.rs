use {
    crate::{pretty_wrappers::PrettyBitflag, AllocationKey},
    ash::vk,
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("The queue has already been started and was not submitted")]
    QueueInUse,

    #[error("The queue must be started before allocations can be added")]
    QueueNotStarted,

    #[error("Adding the allocation would exceed the queue's byte cap")]
    QueueFull,

    #[error("Unable to find or evict enough room in the stage buffer")]
    StageFull,

    #[error("Unable to find or evict enough room in the upload memory")]
    UploadFull,

    #[error("The allocator has reached its allocation cap")]
    AllocatorFull,

    #[error("Unable to bind the uploaded images to device memory")]
    BindImageFail,

    #[error("Granularity {0} is not a power of two aligned to {1} bytes")]
    MisalignedBitGranularity(u64, u64),

    #[error("An allocation of {0} bytes can never fit in the queue")]
    AllocationTooLarge(u64),

    #[error("{0:?} must be staged before it can be uploaded")]
    NotStaged(AllocationKey),

    #[error("{0:?} does not belong to this allocator")]
    UnknownKey(AllocationKey),

    #[error("No memory type for bits {0} and flags {1:#?}")]
    NoSupportedTypeForProperties(PrettyBitflag, vk::MemoryPropertyFlags),

    #[error(transparent)]
    RuntimeError(#[from] anyhow::Error),
}
