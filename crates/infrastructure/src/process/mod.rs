pub mod local_process_manager;

pub use local_process_manager::LocalProcessManager;
