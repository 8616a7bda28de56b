pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

// upper bound on live client connections (slab slots are indexed by fd)
pub const MAX_FD: usize = 65536;
pub const MAX_EVENT_NUMBER: usize = 10000;

// idle-timer granularity in seconds; a connection expires after 3 slots
pub const TIMESLOT: u64 = 5;
pub const IDLE_SLOTS: u64 = 3;

pub const DEFAULT_THREAD_NUMBER: usize = 8;
pub const DEFAULT_MAX_REQUESTS: usize = 10000;
pub const DEFAULT_SQL_NUM: usize = 8;

// how long a worker waits for a database handle before processing without one
pub const DB_ACQUIRE_TIMEOUT_MS: u64 = 500;

// epoll_wait timeout while pool tasks are outstanding / while idle
pub const IN_FLIGHT_POLL_MS: i32 = 1;
pub const IDLE_POLL_MS: i32 = 100;
