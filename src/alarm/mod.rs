pub mod format;
pub mod horizon;
pub mod model;
pub mod scheduler;
pub mod window;
