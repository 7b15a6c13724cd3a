use crate::error::{EtlError, EtlResult};

/// Maps client addresses to ISO country codes.
pub trait GeoLocator: Send + Sync {
    fn country(&self, ip: &str) -> Option<String>;
}

/// Locator used when no geolocation database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoLocator;

impl GeoLocator for NoGeoLocator {
    fn country(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// Longest-prefix lookup over a fixed table of address prefixes.
#[derive(Debug, Default, Clone)]
pub struct PrefixLocator {
    prefixes: Vec<(String, String)>,
}

impl PrefixLocator {
    pub fn new<P, C>(table: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: Into<String>,
        C: Into<String>,
    {
        let mut prefixes: Vec<(String, String)> = table
            .into_iter()
            .map(|(p, c)| (p.into(), c.into()))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { prefixes }
    }
}

impl PrefixLocator {
    /// Parses `prefix=CC` pairs separated by commas.
    pub fn parse(raw: &str) -> EtlResult<Self> {
        let mut table = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((prefix, country)) = entry.split_once('=') else {
                return Err(EtlError::config(format!(
                    "geo entry `{entry}` is not `prefix=CC`"
                )));
            };
            table.push((prefix.trim(), country.trim()));
        }
        Ok(Self::new(table))
    }
}

impl GeoLocator for PrefixLocator {
    fn country(&self, ip: &str) -> Option<String> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| ip.starts_with(prefix.as_str()))
            .map(|(_, country)| country.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let geo = PrefixLocator::new([("10.", "AT"), ("10.1.", "DE")]);
        assert_eq!(geo.country("10.1.2.3").as_deref(), Some("DE"));
        assert_eq!(geo.country("10.2.2.3").as_deref(), Some("AT"));
        assert_eq!(geo.country("192.168.0.1"), None);
        assert_eq!(NoGeoLocator.country("10.1.2.3"), None);
    }

    #[test]
    fn parses_prefix_table() {
        let geo = PrefixLocator::parse("10.=AT, 10.1.=DE,").unwrap();
        assert_eq!(geo.country("10.1.9.9").as_deref(), Some("DE"));
        assert!(PrefixLocator::parse("10.AT").is_err());
    }
}
