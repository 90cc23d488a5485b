pub mod discovery;
pub mod transport;

pub use discovery::{Announcement, AnnouncementKind, Discovery};
pub use transport::ConnectionHandler;
