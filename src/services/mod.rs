pub mod address;
pub mod classifier;
pub mod detect_queue;
pub mod frame_hub;
pub mod registry;
pub mod stream_proxy;
pub mod transcode;
