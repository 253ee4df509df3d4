use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Opaque market data identifier of a watched instrument (eg/ "NSE_EQ|INE002A01018").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct InstrumentKey(pub SmolStr);

impl InstrumentKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

impl From<String> for InstrumentKey {
    fn from(value: String) -> Self {
        Self(SmolStr::from(value))
    }
}

impl AsRef<str> for InstrumentKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Watched instrument.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Constructor, Deserialize, Serialize)]
pub struct Instrument {
    pub instrument_key: InstrumentKey,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "tradingsymbol")]
    pub symbol: String,
}
