//! Engine notifications: typed events, boundary decoding, history, fan-out.

pub mod event;
pub mod history;
pub mod raw;
pub mod subscribers;

pub use event::{EventKind, EventPayload, NativeEvent};
pub use history::{DEFAULT_HISTORY_LIMIT, EventHistory};
pub use raw::{EventDecodeError, RawNativeEvent};
pub use subscribers::{EventHandler, SubscriberSet, SubscriptionHandle};
