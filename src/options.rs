use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Option names understood by the watchface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionKey {
    Invert,
    Animation,
    Separator,
    Vibration,
    ShowSeconds,
    DateFormat,
}

impl OptionKey {
    /// Name used in the stored record, the page payload and the URL query.
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::Invert => "inv",
            OptionKey::Animation => "anim",
            OptionKey::Separator => "sep",
            OptionKey::Vibration => "vibr",
            OptionKey::ShowSeconds => "showsec",
            OptionKey::DateFormat => "datefmt",
        }
    }

    /// Numeric key used by the device when the set travels as an app message.
    pub fn app_key(&self) -> u32 {
        match self {
            OptionKey::Invert => 1,
            OptionKey::Animation => 2,
            OptionKey::Separator => 3,
            OptionKey::DateFormat => 4,
            OptionKey::Vibration => 5,
            // Watch builds shipped so far define keys 1 to 5 only; a build
            // that shows seconds must read `showsec` from 6.
            OptionKey::ShowSeconds => 6,
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scalar option value, kept exactly as the configuration page sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Number(n) => write!(f, "{n}"),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Number(value.into())
    }
}

/// The user's display preferences.
///
/// Only presence is ever checked; values pass through untouched. Keys outside
/// the known set are dropped on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inv: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anim: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sep: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibr: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub showsec: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datefmt: Option<OptionValue>,
}

impl OptionSet {
    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        match key {
            OptionKey::Invert => self.inv.as_ref(),
            OptionKey::Animation => self.anim.as_ref(),
            OptionKey::Separator => self.sep.as_ref(),
            OptionKey::Vibration => self.vibr.as_ref(),
            OptionKey::ShowSeconds => self.showsec.as_ref(),
            OptionKey::DateFormat => self.datefmt.as_ref(),
        }
    }

    pub fn with(mut self, key: OptionKey, value: impl Into<OptionValue>) -> Self {
        let slot = match key {
            OptionKey::Invert => &mut self.inv,
            OptionKey::Animation => &mut self.anim,
            OptionKey::Separator => &mut self.sep,
            OptionKey::Vibration => &mut self.vibr,
            OptionKey::ShowSeconds => &mut self.showsec,
            OptionKey::DateFormat => &mut self.datefmt,
        };
        *slot = Some(value.into());
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> String {
        // Every field is a plain scalar, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Fields recognized by `schema` that are present, in schema order.
    pub fn fields<'a>(
        &'a self,
        schema: &'a Schema,
    ) -> impl Iterator<Item = (OptionKey, &'a OptionValue)> + 'a {
        schema
            .keys()
            .iter()
            .filter_map(move |key| self.get(*key).map(|value| (*key, value)))
    }

    /// Dictionary keyed by device app keys, as delivered to the watch.
    pub fn to_app_message(&self, schema: &Schema) -> BTreeMap<u32, OptionValue> {
        self.fields(schema)
            .map(|(key, value)| (key.app_key(), value.clone()))
            .collect()
    }
}

/// Which option fields a watchface build understands, and in which order
/// they are written to the configuration URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schema {
    #[default]
    WithSeconds,
    WithoutSeconds,
}

const WITH_SECONDS: [OptionKey; 6] = [
    OptionKey::Invert,
    OptionKey::Animation,
    OptionKey::Separator,
    OptionKey::Vibration,
    OptionKey::ShowSeconds,
    OptionKey::DateFormat,
];

const WITHOUT_SECONDS: [OptionKey; 5] = [
    OptionKey::Invert,
    OptionKey::Animation,
    OptionKey::Separator,
    OptionKey::DateFormat,
    OptionKey::Vibration,
];

impl Schema {
    pub fn keys(&self) -> &'static [OptionKey] {
        match self {
            Schema::WithSeconds => &WITH_SECONDS,
            Schema::WithoutSeconds => &WITHOUT_SECONDS,
        }
    }
}

impl FromStr for Schema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "with-seconds" | "a" => Ok(Schema::WithSeconds),
            "without-seconds" | "b" => Ok(Schema::WithoutSeconds),
            _ => Err(format!(
                "Invalid schema '{}'. Valid options: with-seconds, without-seconds",
                s
            )),
        }
    }
}
