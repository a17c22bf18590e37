pub mod repository;
pub mod scheduler;
pub mod worker;

pub use repository::*;
pub use scheduler::*;
pub use worker::*;
