pub mod local_store;
pub mod part_uploader;
pub mod recorder;
pub mod remote;
pub mod tracks;
pub mod upload_queue;

#[cfg(test)]
pub(crate) mod testing;
