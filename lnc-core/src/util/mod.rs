/// Key derivation and signing helpers
pub mod crypto_utils;
/// Serde adapters for persisted channel state
pub mod ser_util;

/// Fixtures for unit and integration tests
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
