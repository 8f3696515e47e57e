//! Credential storage and browser-based key acquisition

mod login;
mod store;

pub use login::{LoginFlow, LoginManager, LoginOptions, LoginStatus};
pub use store::CredentialStore;
