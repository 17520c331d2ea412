//! DNS message handling: wire codec helpers, EDNS/ECS, synthetic
//! responses, question fingerprints, and DNS64 synthesis.

pub mod codec;
pub mod dns64;
pub mod ecs;
pub mod fingerprint;
pub mod message;

pub use dns64::Dns64;
pub use fingerprint::Fingerprint;
