pub mod catalog;
pub mod integration;
pub mod job;
pub mod raw_record;
pub mod target;

pub use integration::Integration;
pub use job::EtlJob;
pub use raw_record::RawRecord;
