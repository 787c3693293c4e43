//! Invoices of an account, kept in `invoices.json` in the account directory

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lightning_channel::htlc::{PaymentHash, PaymentPreimage};
use lightning_channel::onion::{IncomingPayment, PaymentRegistry};
use lightning_channel::persist::Error;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const INVOICES_FILE: &str = "invoices.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceEntry {
    pub preimage: PaymentPreimage,
    pub amount_msat: Option<u64>,
    /// Set once an HTLC paying this invoice is irrevocably fulfilled
    #[serde(default)]
    pub settled_msat: Option<u64>,
}

/// A [PaymentRegistry] over the invoice file, which is rewritten on settlement
pub struct FileInvoices {
    path: PathBuf,
    entries: Mutex<Vec<InvoiceEntry>>,
}

impl FileInvoices {
    /// A missing file is an empty registry
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(INVOICES_FILE);
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Unavailable(format!("{}: {}", path.display(), e))),
        };
        Ok(FileInvoices { path, entries: Mutex::new(entries) })
    }

    pub fn entries(&self) -> Vec<InvoiceEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn store(&self, entries: &[InvoiceEntry]) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::Internal(format!("{}: {}", self.path.display(), e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Unavailable(format!("{}: {}", self.path.display(), e)))
    }
}

impl PaymentRegistry for FileInvoices {
    fn lookup(&self, payment_hash: &PaymentHash) -> Option<IncomingPayment> {
        let entries = self.entries.lock().ok()?;
        entries.iter().find(|e| e.preimage.payment_hash() == *payment_hash).map(|e| {
            IncomingPayment { preimage: e.preimage, amount_msat: e.amount_msat }
        })
    }

    fn settled(&self, payment_hash: &PaymentHash, amount_msat: u64) {
        let Ok(mut entries) = self.entries.lock() else { return };
        let Some(entry) = entries.iter_mut().find(|e| e.preimage.payment_hash() == *payment_hash)
        else {
            warn!("settled unknown invoice {:?}", payment_hash);
            return;
        };
        entry.settled_msat = Some(amount_msat);
        info!("invoice {:?} settled for {} msat", payment_hash, amount_msat);
        if let Err(e) = self.store(&entries) {
            warn!("cannot record settlement: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn settlement_is_written_back() {
        let tempdir = TempDir::new().unwrap();
        let preimage = PaymentPreimage([7; 32]);
        let entries =
            vec![InvoiceEntry { preimage, amount_msat: Some(5_000), settled_msat: None }];
        fs::write(tempdir.path().join(INVOICES_FILE), serde_json::to_vec(&entries).unwrap())
            .unwrap();

        let invoices = FileInvoices::load(tempdir.path()).unwrap();
        let hash = preimage.payment_hash();
        assert_eq!(invoices.lookup(&hash).unwrap().amount_msat, Some(5_000));
        assert!(invoices.lookup(&PaymentHash([0; 32])).is_none());
        invoices.settled(&hash, 5_000);

        let reloaded = FileInvoices::load(tempdir.path()).unwrap();
        assert_eq!(reloaded.entries()[0].settled_msat, Some(5_000));
    }

    #[test]
    fn missing_file_is_empty() {
        let tempdir = TempDir::new().unwrap();
        let invoices = FileInvoices::load(tempdir.path()).unwrap();
        assert!(invoices.entries().is_empty());
    }
}
