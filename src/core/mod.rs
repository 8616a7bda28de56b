pub mod constants;
pub mod epoll;
pub mod socket;
pub mod sync;
