//! Webhook ingress
//!
//! Signature verification with replay protection, event construction and
//! idempotent dispatch to registered handlers. The HTTP surface lives with
//! the host; this module defines the contract it drives: 400 for
//! `InvalidSignature` / `WebhookReplayRejected` / `MalformedWebhook`, 200
//! otherwise — including unknown event types, so providers do not build
//! redelivery storms.

pub mod dispatcher;
pub mod signature;

pub use dispatcher::{ProcessOutcome, WebhookDispatcher, WebhookHandler};
pub use signature::{
    compute_signature, extract_event_id, parse_signature_header, HmacSignatureVerifier,
    SignatureHeader,
};
