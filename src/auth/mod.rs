mod refresh;
pub(crate) mod store;
mod token_store;

pub use refresh::{AuthFailure, AuthFailureHandler, RefreshCoordinator, RefreshOutcome};
pub use store::{JsonFileStore, KeyValueStore, KeyringStore, MemoryStore, StoreError};
pub use token_store::AuthTokenStore;
