pub mod device;
pub mod job;
pub mod session;
pub mod stream;
