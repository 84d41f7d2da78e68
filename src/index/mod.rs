pub mod bounded;
pub mod path;

pub use bounded::{BoundedTorrentIndex, EvictionListener, IndexEntry, SEPARATOR};
pub use path::{AbsolutePaths, ParentDirConverter, PathConverter};
