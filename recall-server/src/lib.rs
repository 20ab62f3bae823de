pub mod router;
pub mod server;

pub use router::AppState;
