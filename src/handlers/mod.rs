pub mod join;

pub use join::*;
