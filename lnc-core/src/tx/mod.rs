/// BOLT #3 output scripts
pub mod script;
/// Commitment, HTLC and sweep transaction construction
#[allow(clippy::module_inception)]
pub mod tx;
