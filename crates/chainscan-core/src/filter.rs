//! Address filter supplied per scan session.

/// Decides which addresses the scanner reports on.
///
/// Returns the opaque *source key* (the wallet entity owning the address)
/// when the address is watched, `None` otherwise.
pub trait AddressFilter: Send + Sync {
    fn source_key(&self, address: &str) -> Option<String>;
}

impl<F> AddressFilter for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn source_key(&self, address: &str) -> Option<String> {
        self(address)
    }
}

/// Filter that watches nothing. Used until a session installs a real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl AddressFilter for RejectAll {
    fn source_key(&self, _address: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn closure_filter() {
        let watched: HashMap<String, String> =
            [("addr1".to_string(), "wallet-a".to_string())].into_iter().collect();
        let filter = move |addr: &str| watched.get(addr).cloned();

        assert_eq!(filter.source_key("addr1").as_deref(), Some("wallet-a"));
        assert!(filter.source_key("addr2").is_none());
        assert!(RejectAll.source_key("addr1").is_none());
    }
}
