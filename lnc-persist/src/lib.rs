//! File-backed persistence for the channel layer

/// Channel, breach and unresolved-HTLC files
pub mod fs;
pub mod invoices;
/// Account directories
pub mod wallet;

pub use fs::FileStore;
pub use invoices::FileInvoices;
