//! Salmon magic envelopes
//!
//! Legacy actors without an inbox receive activities as a signed Atom entry
//! wrapped in a magic envelope, POSTed to their `_:salmonUrl`.

use base64::{Engine, engine::general_purpose::URL_SAFE};
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;

use crate::data::SigningKey;
use crate::error::AppError;

pub const MAGIC_ENVELOPE_CONTENT_TYPE: &str = "application/magic-envelope+xml";

const DATA_TYPE: &str = "application/atom+xml";
const ENCODING: &str = "base64url";
const ALGORITHM: &str = "RSA-SHA256";

/// Bytes covered by the envelope signature.
fn signature_base(data: &str) -> String {
    [
        data.to_string(),
        URL_SAFE.encode(DATA_TYPE),
        URL_SAFE.encode(ENCODING),
        URL_SAFE.encode(ALGORITHM),
    ]
    .join(".")
}

/// Wrap an Atom entry in a signed magic envelope.
pub fn magic_envelope(atom_entry: &str, key: &SigningKey) -> Result<String, AppError> {
    let data = URL_SAFE.encode(atom_entry.as_bytes());

    let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;
    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let signature = signer.sign(signature_base(&data).as_bytes());

    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <me:env xmlns:me=\"http://salmon-protocol.org/ns/magic-env\">\
         <me:data type=\"{}\">{}</me:data>\
         <me:encoding>{}</me:encoding>\
         <me:alg>{}</me:alg>\
         <me:sig key_id=\"{}\">{}</me:sig>\
         </me:env>",
        DATA_TYPE,
        data,
        ENCODING,
        ALGORITHM,
        html_escape::encode_double_quoted_attribute(&key.key_id()),
        URL_SAFE.encode(signature.to_bytes()),
    ))
}
