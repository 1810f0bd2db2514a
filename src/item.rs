//! Items flowing along the edges of a job.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Event-time marker: no item with a lower timestamp will arrive on
/// the edge after this one.
///
/// Watermarks on a single edge are non-decreasing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub i64);

impl Watermark {
    pub fn timestamp(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm({})", self.0)
    }
}

/// One element of an inbox or outbox.
///
/// User data is carried as a [`Value`] so that a graph can mix
/// stages with different item types. Use [`Item::encode`] and
/// [`Item::decode`] to move between typed data and items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    Data(Value),
    Watermark(Watermark),
}

impl Item {
    pub fn encode<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(data).map(Self::Data)
    }

    /// Decode data items. Fails on watermarks.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Data(value) => T::deserialize(value),
            Self::Watermark(wm) => Err(serde::de::Error::custom(format!(
                "expected a data item, found {wm}"
            ))),
        }
    }

    pub fn wm(timestamp: i64) -> Self {
        Self::Watermark(Watermark(timestamp))
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self, Self::Watermark(_))
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<Watermark> for Item {
    fn from(wm: Watermark) -> Self {
        Self::Watermark(wm)
    }
}

#[test]
fn decode_round_trip() {
    let item = Item::encode(&(3, "a")).unwrap();
    assert_eq!(item, Item::Data(serde_json::json!([3, "a"])));
    assert_eq!(item.decode::<(i64, String)>().unwrap(), (3, "a".to_string()));
    assert!(Item::wm(4).decode::<i64>().is_err());
}

#[test]
fn watermark_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &Watermark(12),
        &[Token::NewtypeStruct { name: "Watermark" }, Token::I64(12)],
    );
}
