// Authentication module
// Manages the credential lifecycle: storage, claim decoding and renewal

pub mod codec;
mod credentials;
mod manager;
mod store;
mod types;

pub use credentials::{MemoryPersistence, Persistence, SqlitePersistence};
pub use manager::{
    CredentialManager, ManagerConfig, RenewalOutcome, RenewalResilience, DEFAULT_RENEW_PATH,
    RENEWAL_BREAKER_KEY,
};
pub use store::CredentialStore;
pub use types::{AuthEvent, AuthStatus, Claims, CredentialKind, CredentialPair, UserProfile};
