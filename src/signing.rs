//! Signed self-modification proposals are out of core scope. This is the
//! contract boundary the core consumes; key management and concrete
//! signature schemes live outside this crate.

/// Produces a detached signature over arbitrary bytes.
pub trait Signer: Send + Sync {
    /// Sign `bytes`, returning the signature and a reference to the key
    /// used (an opaque identifier, never the key material itself).
    fn sign(&self, bytes: &[u8]) -> Signature;
}

/// Verifies a signature produced by a [`Signer`].
pub trait Verifier: Send + Sync {
    fn verify(&self, bytes: &[u8], signature: &Signature) -> bool;
}

/// A detached signature plus a reference to the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub sig: Vec<u8>,
    pub pub_key_ref: String,
}
