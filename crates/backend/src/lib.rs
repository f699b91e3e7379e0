//! Read-only backends for the rangefs virtual filesystem.
//!
//! A backend answers the five questions a read-only filesystem layer asks:
//! does a path exist, is it a directory, what does it contain, how large is
//! it, and what bytes does it hold at a given offset. File content is served
//! through a [`BufferRegistry`](rangefs_cache::BufferRegistry), so every
//! distinct content stream gets its own prefetching block cache.
//!
//! Backends form a closed set, chosen explicitly at startup:
//!
//! - [`StaticBackend`] - flat in-memory fixture
//! - [`LocalDirBackend`] - local directory tree, walked once at startup
//! - [`ImageBackend`] - filesystem image (JSON tree of hashed files) over a
//!   content-addressed store

mod backend;
mod error;
pub mod image;
mod local;
mod static_backend;

pub use backend::{Backend, ReadOnlyBackend};
pub use error::BackendError;
pub use image::{
    build_image, ContentStore, DirContentStore, HashRangeSource, ImageBackend, ImageFile, ImageNode,
};
pub use local::LocalDirBackend;
pub use static_backend::StaticBackend;
