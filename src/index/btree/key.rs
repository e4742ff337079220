use std::fmt;

use serde::{Deserialize, Serialize};

/// One component of a composite key. Components of different kinds order
/// by kind first: Null < Int < UInt < Text < Bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Multi-column index key compared component by component in column order.
/// A key that is a strict prefix of another sorts before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeKey(pub Vec<KeyPart>);

impl CompositeKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    /// The first `n` components
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0.iter().take(n).cloned().collect())
    }

    pub fn starts_with(&self, prefix: &CompositeKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<u64> for KeyPart {
    fn from(v: u64) -> Self {
        KeyPart::UInt(v)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Text(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Text(v)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(v: Vec<u8>) -> Self {
        KeyPart::Bytes(v)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyPart::Null, Into::into)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "NULL"),
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::UInt(v) => write!(f, "{}", v),
            KeyPart::Text(v) => write!(f, "'{}'", v),
            KeyPart::Bytes(v) => write!(f, "x'{}'", hex::encode(v)),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[KeyPart]) -> CompositeKey {
        CompositeKey::new(parts.to_vec())
    }

    #[test]
    fn test_component_wise_order() {
        let a = key(&[KeyPart::Int(1), KeyPart::Text("b".into())]);
        let b = key(&[KeyPart::Int(1), KeyPart::Text("c".into())]);
        let c = key(&[KeyPart::Int(2), KeyPart::Text("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_prefix_sorts_first() {
        let short = CompositeKey::default().push(7i64);
        let long = short.clone().push("x");
        assert!(short < long);
        assert!(long.starts_with(&short));
        assert_eq!(long.prefix(1), short);
    }

    #[test]
    fn test_null_sorts_lowest() {
        let null = key(&[KeyPart::from(None::<i64>)]);
        let min = key(&[KeyPart::Int(i64::MIN)]);
        assert!(null < min);
        assert_eq!(null.to_string(), "(NULL)");
    }

    #[test]
    fn test_negative_ints_order() {
        let mut keys: Vec<CompositeKey> = [5i64, -3, 0, -100].iter().map(|&v| CompositeKey::default().push(v)).collect();
        keys.sort();
        let ints: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(ints, vec!["(-100)", "(-3)", "(0)", "(5)"]);
    }
}
