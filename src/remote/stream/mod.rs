mod persistent;
mod watch;
mod write;

pub use persistent::{PersistentStream, PersistentStreamState, StreamEvents, StreamKind};
pub use watch::{WatchStream, WatchStreamListener};
pub use write::{WriteStream, WriteStreamListener};
