pub mod archive;
pub mod files;
pub mod hash;

pub use files::FileEntry;
pub use hash::HashUtils;
