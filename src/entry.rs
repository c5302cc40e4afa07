//! The three roles the binary can run in, each mapped to an exit status.

use crate::config::Config;
use crate::confirm::Confirmer;
use crate::delivery::Deliver;
use crate::logging::log_fatal;
use crate::token_store::{MarkerBackend, TokenStore};
use crate::tokenizer::Tokenizer;
use std::time::Duration;

/// Exit status for a mail role whose configuration failed to load.
pub const MAIL_CONFIG_FAILURE: i32 = 1;

/// A broken confirm setup must not bounce inbound mail.
pub const CONFIRM_CONFIG_FAILURE: i32 = 0;

pub const CLEAN_CONFIG_FAILURE: i32 = 1;

/// Outbound wrapper: tokenizes `input` if needed and delivers it with
/// `args` appended to the delivery command.
pub fn run_mail<D: Deliver>(config: &Config, input: &[u8], args: &[String], delivery: &D) -> i32 {
    let store = TokenStore::open(config);
    match Tokenizer::new(config, &store).send(delivery, input, args) {
        Ok(()) => 0,
        Err(e) => {
            log_fatal("failed sending mail", &e);
            e.exit_code()
        }
    }
}

/// Inbound filter: 99 when a confirmation notice was answered, 0 otherwise.
pub fn run_confirm<D: Deliver>(config: &Config, input: &[u8], delivery: &D) -> i32 {
    let store = TokenStore::open(config);
    Confirmer::new(config, &store, delivery)
        .handle(input)
        .exit_code()
}

/// Removes markers older than the configured token lifetime.
pub fn run_clean(config: &Config) -> i32 {
    clean(&TokenStore::open(config), config.token_lifetime())
}

fn clean<B: MarkerBackend>(store: &TokenStore<B>, lifetime: Duration) -> i32 {
    match store.sweep(lifetime) {
        Ok(removed) => {
            log::debug!("Removed {removed} expired token(s).");
            0
        }
        Err(e) => {
            log_fatal("failed cleaning tokens", &e);
            1
        }
    }
}
