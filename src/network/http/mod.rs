pub mod ban;
pub mod blacklist;
