pub mod config;
pub mod confirm;
pub mod delivery;
pub mod entry;
pub mod logging;
pub mod message;
pub mod token_store;
pub mod tokenizer;

pub use config::{Config, ConfigError};
pub use confirm::{Confirmer, Outcome, PassReason};
pub use delivery::{Deliver, DeliveryError, ProgramDelivery};
pub use message::{Address, Message};
pub use token_store::{FsMarkers, MarkerBackend, StoreError, TokenStore};
pub use tokenizer::Tokenizer;
