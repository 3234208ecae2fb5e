pub mod job;
pub mod operation;
pub mod provider;
pub mod quota;
pub mod template;
pub mod usage;
