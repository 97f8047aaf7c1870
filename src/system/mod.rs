pub mod cache;
pub mod clock;
pub mod fanout;
pub mod interval;
pub mod log;
