//! Federation plumbing
//!
//! - HTTP Signatures for outbound requests and inbound inbox posts
//! - Audience resolution and delivery fan-out
//! - Host policy for outbound requests
//! - Atom and Salmon rendering for legacy peers

mod atom;
mod delivery;
mod host;
mod salmon;
mod signature;

pub use atom::{render_entry, render_feed};
pub use delivery::{DeliveryPlan, DeliveryService, MAX_EXPANSION_DEPTH, unique_inbox_targets};
pub use host::HostPolicy;
pub use salmon::{MAGIC_ENVELOPE_CONTENT_TYPE, magic_envelope};
pub use signature::{
    SignatureHeaders, extract_signature_key_id, generate_digest, generate_key_pair,
    key_id_matches_actor, parse_signature_header, public_key_pem_from, sign_request,
    verify_signature,
};
