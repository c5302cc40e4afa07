//! Inbound side: recognise a list manager's confirmation notice, check
//! that it quotes a message carrying one of our tokens, and answer it.
//!
//! Every path through [`Confirmer::handle`] ends in an [`Outcome`]. Errors
//! never escape: a notice we cannot process is passed through so that a
//! human still gets to see it.

use crate::config::Config;
use crate::delivery::{Deliver, DeliveryError};
use crate::logging::log_fatal;
use crate::message::Message;
use crate::token_store::{FsMarkers, MarkerBackend, StoreError, TokenStore};
use std::io;

/// Display name the list manager uses on its confirmation notices.
pub const CONFIRM_SENDER_NAME: &str = "The qsecretary program";

/// Line after which a notice quotes the original message.
pub const ORIGINAL_SEPARATOR: &str = "--- Below this line is the top of your message.";

/// Exit status telling the MTA to deliver the message normally.
pub const EXIT_PASS: i32 = 0;

/// Exit status telling the MTA the message has been dealt with.
pub const EXIT_HANDLED: i32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    NotConfirmation,
    UntrustedDomain,
    TokenRejected,
    NoConfirmationAddress,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    PassThrough(PassReason),
    Confirmed { from: String, token: String },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::PassThrough(_) => EXIT_PASS,
            Outcome::Confirmed { .. } => EXIT_HANDLED,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("failed reading notice body ({0})")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed sending confirmation ({0})")]
    Delivery(#[from] DeliveryError),
}

/// Pulls the quoted original out of a notice body. Everything up to and
/// including [`ORIGINAL_SEPARATOR`] and any blank lines after it are
/// dropped. Without a separator the whole body is taken as the original.
pub fn extract_original(notice: &mut Message) -> io::Result<Message> {
    notice.rewind_body();
    let lines = notice.body_lines()?;

    let quoted = lines
        .iter()
        .position(|line| is_separator(line))
        .map_or(&lines[..], |pos| &lines[pos + 1..]);

    let original: Vec<u8> = quoted
        .iter()
        .skip_while(|line| line.iter().all(u8::is_ascii_whitespace))
        .flatten()
        .copied()
        .collect();
    Ok(Message::from_bytes(original))
}

fn is_separator(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line == ORIGINAL_SEPARATOR.as_bytes()
}

pub struct Confirmer<'a, D, B = FsMarkers> {
    config: &'a Config,
    store: &'a TokenStore<B>,
    delivery: &'a D,
}

impl<'a, D: Deliver, B: MarkerBackend> Confirmer<'a, D, B> {
    pub fn new(config: &'a Config, store: &'a TokenStore<B>, delivery: &'a D) -> Self {
        Self {
            config,
            store,
            delivery,
        }
    }

    /// Runs the protocol over a raw inbound message. Never fails.
    pub fn handle(&self, raw: &[u8]) -> Outcome {
        let mut message = Message::from_bytes(raw);
        match self.process(&mut message) {
            Ok(outcome) => outcome,
            Err(ConfirmError::Store(e @ StoreError::Remove { .. })) => {
                log_fatal("error handling token", &e);
                Outcome::PassThrough(PassReason::Failed)
            }
            Err(e) => {
                log_fatal("error processing notice", &e);
                Outcome::PassThrough(PassReason::Failed)
            }
        }
    }

    pub fn process(&self, message: &mut Message) -> Result<Outcome, ConfirmError> {
        let from = message.addr("from").unwrap_or_default();
        if from.name != CONFIRM_SENDER_NAME {
            log::trace!(
                "not a confirmation notice (from \"{}\" <{}>)",
                or_unknown(&from.name, "Unknown"),
                or_unknown(&from.addr, "<Unknown>")
            );
            return Ok(Outcome::PassThrough(PassReason::NotConfirmation));
        }

        if !self.config.is_confirm_domain(from.domain()) {
            log::info!(
                "Ignored confirmation notice (incorrect domain), from \"{}\"",
                from.addr
            );
            return Ok(Outcome::PassThrough(PassReason::UntrustedDomain));
        }

        let original = extract_original(message)?;
        let token = original.header_or(&self.config.auth_field, "").trim().to_string();
        if token.is_empty() {
            log::warn!("Warning:  failed to find token in message from {}.", from.addr);
        } else {
            log::trace!("Received confirmation notice with token {token}.");
        }

        if !self.store.redeem(&token)? {
            log::error!("Error:  did not find matching token file ({token})");
            return Ok(Outcome::PassThrough(PassReason::TokenRejected));
        }

        let Some(source_addr) = self.config.confirmation_address.as_deref() else {
            log::error!(
                "Error:  failed sending confirmation notice (no confirmation_address configured)"
            );
            return Ok(Outcome::PassThrough(PassReason::NoConfirmationAddress));
        };

        let mut command = self.config.mail_prog.clone();
        command.extend([
            "-f".to_string(),
            source_addr.to_string(),
            from.addr.clone(),
        ]);
        let reply = format!("To: {}\n", from.addr);
        self.delivery.deliver(&command, reply.as_bytes())?;

        log::info!(
            "Authenticated confirmation notice, from \"{}\", token \"{token}\"",
            from.addr
        );
        Ok(Outcome::Confirmed {
            from: from.addr,
            token,
        })
    }
}

fn or_unknown<'a>(value: &'a str, unknown: &'a str) -> &'a str {
    if value.is_empty() {
        unknown
    } else {
        value
    }
}
