mod session;

pub use session::{Platform, RoomSession};
