pub use history::{HistorySource, HttpHistoryLoader};
pub use message::{timestamp, Message};
pub use session::{HistoryState, Session, SessionKey, SessionState, SessionUpdate};
pub use transcript::{OrderingPolicy, Transcript};

mod history;
mod message;
mod session;
mod transcript;
