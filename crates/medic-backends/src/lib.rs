//! Medic Backends - REST adapters for the reconciliation loop
//!
//! - [`FactoryClient`]: run source and rerun executor over the Data Factory
//!   management API, authenticated through a [`TokenProvider`]
//! - [`ChatClassifier`]: failure classification through a chat-completion API
//! - [`LogNotifier`] / [`WebhookNotifier`]: notice delivery

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod auth;
pub mod classifier;
pub mod factory;
mod http;
pub mod notifier;

pub use auth::{Credentials, TokenProvider, CLIENT_ID_ENV, CLIENT_SECRET_ENV, TENANT_ID_ENV};
pub use classifier::{build_prompt, parse_reply, ChatClassifier, ClassifierSettings, API_KEY_ENV};
pub use factory::{FactoryClient, FactorySettings, FACTORY_TOKEN_ENV};
pub use notifier::{LogNotifier, NotificationSettings, WebhookNotifier};
