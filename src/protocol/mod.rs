pub mod events;
pub mod info;
pub mod messages;
pub mod models;
pub mod session;
pub mod stats;
pub mod tracks;

pub use events::*;
pub use info::*;
pub use messages::*;
pub use models::*;
pub use session::*;
pub use stats::*;
pub use tracks::*;
