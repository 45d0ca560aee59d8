use std::borrow::Cow;
use std::collections::BTreeMap;

/// An ordered set of label key/value pairs with unique keys. A metric
/// family records one observer per unique `Attributes`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        assert_legal_key(key);
        self.0.insert(key, value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &'a [(&'static str, &'static str); N]) -> Self {
        pairs
            .iter()
            .fold(Self::new(), |attrs, (k, v)| attrs.with(k, *v))
    }
}

/// Panics unless `s` matches `[0-9a-z_]+`.
fn assert_legal_key(s: &str) {
    assert!(!s.is_empty(), "label key must not be empty");
    assert!(
        s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_')),
        "label key must be [0-9a-z_]+, got {s:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_ordered_and_unique() {
        let attrs = Attributes::new()
            .with("method", "get")
            .with("code", "0")
            .with("method", "put");

        let pairs: Vec<_> = attrs.iter().collect();
        assert_eq!(pairs, vec![("code", "0"), ("method", "put")]);
    }

    #[test]
    #[should_panic]
    fn uppercase_key_rejected() {
        let _ = Attributes::new().with("Method", "get");
    }
}
