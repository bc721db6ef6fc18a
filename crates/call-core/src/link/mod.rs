//! Call link state: records, the update serializer, and the background
//! fetch loop.

mod fetch;
mod store;
mod updater;

pub use fetch::CallLinkFetchJob;
pub use store::{CallLinkRecord, CallLinkRecordStore, CallLinkState, InMemoryCallLinkStore};
pub use updater::{
    AuthCredentialProvider, CallLinkAdminApi, CallLinkStateFetcher, CallLinkStateUpdater,
};
