//! Mapping from CSV rows to `records` rows

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A parsed CSV row keyed by header name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRow(pub HashMap<String, String>);

impl SourceRow {
    pub fn get(&self, header: &str) -> Option<&str> {
        self.0.get(header).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for SourceRow
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One row of the `records` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub phone_1: Option<String>,
    pub phone_2: Option<String>,
    pub email: Option<String>,
    /// Text form, cast to `DATE` on insert
    pub subscription_date: Option<String>,
    pub website: Option<String>,
}

/// Headers the transformer reads, in column order
pub const EXPECTED_HEADERS: [&str; 10] = [
    "First Name",
    "Last Name",
    "Company",
    "City",
    "Country",
    "Phone 1",
    "Phone 2",
    "Email",
    "Subscription Date",
    "Website",
];

/// Map a source row onto the storage shape
///
/// Total: headers that are absent become `None`, unknown headers are ignored.
pub fn transform(row: &SourceRow) -> StorageRecord {
    let field = |header: &str| row.get(header).map(str::to_string);

    StorageRecord {
        first_name: field("First Name"),
        last_name: field("Last Name"),
        company: field("Company"),
        city: field("City"),
        country: field("Country"),
        phone_1: field("Phone 1"),
        phone_2: field("Phone 2"),
        email: field("Email"),
        subscription_date: field("Subscription Date"),
        website: field("Website"),
    }
}

/// Expected headers absent from `row`
pub fn missing_fields(row: &SourceRow) -> Vec<&'static str> {
    EXPECTED_HEADERS
        .iter()
        .copied()
        .filter(|header| row.get(header).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_row() -> SourceRow {
        [
            ("Index", "1"),
            ("Customer Id", "DD37Cf93aecA6Dc"),
            ("First Name", "Sheryl"),
            ("Last Name", "Baxter"),
            ("Company", "Rasmussen Group"),
            ("City", "East Leonard"),
            ("Country", "Chile"),
            ("Phone 1", "229.077.5154"),
            ("Phone 2", "397.884.0519x718"),
            ("Email", "zunigavanessa@smith.info"),
            ("Subscription Date", "2020-08-24"),
            ("Website", "http://www.stephenson.com/"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_transform_maps_every_header() {
        let record = transform(&full_row());
        assert_eq!(record.first_name.as_deref(), Some("Sheryl"));
        assert_eq!(record.last_name.as_deref(), Some("Baxter"));
        assert_eq!(record.company.as_deref(), Some("Rasmussen Group"));
        assert_eq!(record.city.as_deref(), Some("East Leonard"));
        assert_eq!(record.country.as_deref(), Some("Chile"));
        assert_eq!(record.phone_1.as_deref(), Some("229.077.5154"));
        assert_eq!(record.phone_2.as_deref(), Some("397.884.0519x718"));
        assert_eq!(record.email.as_deref(), Some("zunigavanessa@smith.info"));
        assert_eq!(record.subscription_date.as_deref(), Some("2020-08-24"));
        assert_eq!(record.website.as_deref(), Some("http://www.stephenson.com/"));
    }

    #[test]
    fn test_missing_headers_become_none() {
        let row: SourceRow = [("Email", "x@y.z"), ("Unrelated", "ignored")].into_iter().collect();
        let record = transform(&row);

        assert_eq!(record.email.as_deref(), Some("x@y.z"));
        assert_eq!(record.first_name, None);
        assert_eq!(record.website, None);
    }

    #[test]
    fn test_empty_row_is_all_none() {
        assert_eq!(transform(&SourceRow::default()), StorageRecord::default());
    }

    #[test]
    fn test_transform_is_deterministic() {
        let row = full_row();
        assert_eq!(transform(&row), transform(&row));
    }

    #[test]
    fn test_missing_fields_lists_absent_headers() {
        assert!(missing_fields(&full_row()).is_empty());

        let row: SourceRow = [("First Name", "A"), ("Email", "a@b.c")].into_iter().collect();
        let missing = missing_fields(&row);
        assert_eq!(missing.len(), 8);
        assert!(missing.contains(&"Subscription Date"));
        assert!(!missing.contains(&"Email"));
    }
}
