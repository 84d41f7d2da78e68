pub mod atomic;
pub mod cleanup;

pub use atomic::write_atomic;
pub use cleanup::{remove_empty_parents, remove_file_and_empty_parents};
