//! Raw directory entries and the normalized [`SearchResult`].

/// One attribute of a raw entry as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    /// Attribute name, casing as sent by the server.
    pub name: String,
    /// Values in server order.
    pub values: Vec<String>,
    /// Number of values the server reported. Bookkeeping only.
    pub count: usize,
}

impl RawAttribute {
    /// Creates an attribute whose count matches its values.
    #[must_use]
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        let count = values.len();
        Self {
            name: name.into(),
            values,
            count,
        }
    }
}

/// A search result entry before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attributes in server order.
    pub attributes: Vec<RawAttribute>,
}

impl RawEntry {
    /// Creates an entry without attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Appends an attribute.
    #[must_use]
    pub fn with_attribute<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes.push(RawAttribute::new(
            name,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }
}

/// Normalized attributes of the first matching entry.
///
/// Attribute names are case-sensitive and kept in the order the server sent
/// them; values keep their order too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    attributes: Vec<(String, Vec<String>)>,
}

impl SearchResult {
    /// Returns all values of `attribute`.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, values)| values.as_slice())
    }

    /// Returns the first value of `attribute`.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns true if `attribute` is present.
    #[must_use]
    pub fn contains(&self, attribute: &str) -> bool {
        self.values(attribute).is_some()
    }

    /// Attribute names in server order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(name, _)| name.as_str())
    }

    /// Iterates over `(name, values)` pairs in server order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns true if the entry carried no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Converts back into raw attributes.
    #[must_use]
    pub fn into_raw_attributes(self) -> Vec<RawAttribute> {
        self.attributes
            .into_iter()
            .map(|(name, values)| RawAttribute::new(name, values))
            .collect()
    }
}

impl IntoIterator for SearchResult {
    type Item = (String, Vec<String>);
    type IntoIter = std::vec::IntoIter<(String, Vec<String>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.into_iter()
    }
}

/// Normalizes raw attributes into a [`SearchResult`].
///
/// The count bookkeeping is dropped. A name repeated by the server has its
/// values appended to the first occurrence.
pub fn normalize_attributes<I>(attributes: I) -> SearchResult
where
    I: IntoIterator<Item = RawAttribute>,
{
    let mut normalized: Vec<(String, Vec<String>)> = Vec::new();
    for attribute in attributes {
        if attribute.count != attribute.values.len() {
            tracing::debug!(
                attribute = %attribute.name,
                reported = attribute.count,
                received = attribute.values.len(),
                "attribute value count mismatch"
            );
        }
        match normalized.iter_mut().find(|(name, _)| *name == attribute.name) {
            Some((_, values)) => values.extend(attribute.values),
            None => normalized.push((attribute.name, attribute.values)),
        }
    }
    SearchResult {
        attributes: normalized,
    }
}

/// Normalizes one entry, discarding its DN.
#[must_use]
pub fn normalize_entry(entry: RawEntry) -> SearchResult {
    normalize_attributes(entry.attributes)
}
