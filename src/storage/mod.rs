//! S3-compatible object storage
//!
//! Handles:
//! - AWS Signature Version 4 request signing (no vendor SDK)
//! - Signed single-object PUT to the backup bucket and the CDN bucket

mod client;
pub mod signer;

pub use client::{AddressingStyle, Destination, ObjectPutClient, ObjectTarget, PutOutcome};
pub use signer::{CanonicalHeaders, Credentials, SignedHeaders, SigningContext, sign};
