mod session;

pub use session::{ResourceSpec, SessionConfig};
