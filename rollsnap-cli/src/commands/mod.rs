pub mod policy;
pub mod purge;
pub mod snap;
pub mod sync;
