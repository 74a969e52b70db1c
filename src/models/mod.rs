pub mod asset;
pub mod entity;
pub mod job;
pub mod payload;
