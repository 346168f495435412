pub mod fd;
pub mod hash;
