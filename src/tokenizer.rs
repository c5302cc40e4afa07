//! Outbound side: stamp mail for token recipients with an authentication
//! header before handing it to the delivery program.

use crate::config::Config;
use crate::delivery::{Deliver, DeliveryError};
use crate::message::{Message, RECIPIENT_FIELDS};
use crate::token_store::{FsMarkers, MarkerBackend, StoreError, TokenStore};

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed sending mail ({0})")]
    Delivery(#[from] DeliveryError),
}

impl OutboundError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OutboundError::Store(_) => 1,
            OutboundError::Delivery(e) => e.exit_code(),
        }
    }
}

pub struct Tokenizer<'a, B = FsMarkers> {
    config: &'a Config,
    store: &'a TokenStore<B>,
}

impl<'a, B: MarkerBackend> Tokenizer<'a, B> {
    pub fn new(config: &'a Config, store: &'a TokenStore<B>) -> Self {
        Self { config, store }
    }

    /// True if any command-line recipient or any header recipient is a
    /// configured token recipient.
    pub fn should_tokenize(&self, message: &Message, cli_recipients: &[String]) -> bool {
        if cli_recipients
            .iter()
            .any(|arg| self.config.is_token_recipient(arg))
        {
            return true;
        }
        message
            .addr_list(&RECIPIENT_FIELDS)
            .iter()
            .any(|recip| self.config.is_token_recipient(&recip.addr))
    }

    /// Returns `raw` unchanged, or prefixed with the authentication header
    /// when the message needs a token.
    pub fn tokenize_if_needed(
        &self,
        raw: &[u8],
        cli_recipients: &[String],
    ) -> Result<Vec<u8>, StoreError> {
        let message = Message::from_bytes(raw);
        if !self.should_tokenize(&message, cli_recipients) {
            return Ok(raw.to_vec());
        }

        let token = self.store.issue(&message.header_block())?;
        log::info!("Generated token {token}.");

        let mut output = format!("{}: {}\n", self.config.auth_field, token).into_bytes();
        output.extend_from_slice(raw);
        Ok(output)
    }

    /// Tokenizes `raw` if needed and pipes it to the outbound delivery
    /// command with `args` appended.
    pub fn send<D: Deliver>(
        &self,
        delivery: &D,
        raw: &[u8],
        args: &[String],
    ) -> Result<(), OutboundError> {
        let command = self.config.outbound_command(args);
        log::trace!("mailcmd == {command:?}");

        let output = self.tokenize_if_needed(raw, args)?;
        delivery.deliver(&command, &output)?;
        if output.len() != raw.len() {
            log::trace!("Sent tokenized mail.");
        } else {
            log::trace!("Passed mail through unchanged.");
        }
        Ok(())
    }
}
