//! Hardware address → manufacturer lookup.

use std::sync::Arc;

use async_trait::async_trait;
use mac_oui::Oui;
use tokio::sync::OnceCell;

/// Resolves a MAC address to a vendor name. Failures are never surfaced to
/// the caller; an unknown or malformed address is simply `None`.
#[async_trait]
pub trait VendorLookup: Send + Sync {
    async fn resolve(&self, mac: Option<&str>) -> Option<String>;
}

/// OUI table backed resolver.
///
/// The table is parsed once per process on a blocking worker. Concurrent
/// first callers wait on the same initialisation. A failed load is not
/// cached, so the next lookup retries.
#[derive(Clone, Default)]
pub struct OuiVendorResolver {
    db: Arc<OnceCell<Oui>>,
}

impl OuiVendorResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn table(&self) -> Option<&Oui> {
        let loaded = self
            .db
            .get_or_try_init(|| async {
                tracing::info!("Loading OUI vendor table");
                let joined = tokio::task::spawn_blocking(Oui::default).await;
                match joined {
                    Ok(Ok(db)) => Ok(db),
                    Ok(Err(e)) => Err(format!("{e:?}")),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match loaded {
            Ok(db) => Some(db),
            Err(e) => {
                tracing::warn!(error = %e, "OUI vendor table unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl VendorLookup for OuiVendorResolver {
    async fn resolve(&self, mac: Option<&str>) -> Option<String> {
        let mac = normalize_mac(mac?)?;
        let db = self.table().await?;
        match db.lookup_by_mac(&mac) {
            Ok(Some(entry)) => Some(entry.company_name.clone()),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(mac = %mac, error = ?e, "Vendor lookup failed");
                None
            }
        }
    }
}

/// Canonical `AA:BB:CC:DD:EE:FF` form, or `None` if the input is not a MAC.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let upper = hex.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}
