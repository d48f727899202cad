//! Sub-allocators carving independent spans out of a region

mod first_fit;

pub use first_fit::FirstFitAllocator;
