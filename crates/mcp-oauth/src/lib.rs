//! OAuth 2.0 authorization-code-with-PKCE support for remote MCP servers.
//!
//! The pieces compose bottom-up: a [`CredentialStore`] persists per-server
//! registrations, tokens and verifiers; a [`CallbackListener`] receives the
//! browser redirect; an [`OAuthClientProvider`] exposes both to the
//! [`OAuthAuthorizer`], and the [`OAuthCoordinator`] ties them into one flow.

pub mod authorizer;
pub mod browser;
pub mod callback_server;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod pkce;
pub mod provider;
pub mod storage;
pub mod types;

pub use authorizer::OAuthAuthorizer;
pub use browser::{BrowserOpener, SystemBrowser};
pub use callback_server::{CallbackListener, CallbackOptions, CALLBACK_PATH};
pub use coordinator::{CoordinatorOptions, OAuthCoordinator};
pub use error::{OAuthError, Result};
pub use provider::{OAuthClientProvider, StoreBackedProvider};
pub use storage::{AesGcmCipher, CredentialStore, SecretCipher};
pub use types::*;
