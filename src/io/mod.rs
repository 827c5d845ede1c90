//! Destination stores and scratch file lists.

mod filelist;
mod store;

pub use filelist::write_file_list;
pub use store::{create_sync_store, sync_config};
