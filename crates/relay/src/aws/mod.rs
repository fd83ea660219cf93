//! AWS SDK client initialisation for Secrets Manager, KMS, S3, and Athena.
//!
//! All clients share one resolved SDK configuration. An endpoint override
//! can point every client at a local stack for development.

pub mod clients;

pub use clients::AwsClients;
