use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

/// A collation configuration. See the official MongoDB
/// [documentation](https://www.mongodb.com/docs/manual/reference/collation/) for more information on
/// each of the fields.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Collation {
    /// The ICU locale.
    #[builder(!default)]
    pub locale: String,

    /// The level of comparison to perform. Corresponds to [ICU Comparison Levels](https://unicode-org.github.io/icu/userguide/collation/concepts.html#comparison-levels).
    pub strength: Option<u32>,

    /// Whether to include a separate level for case differences. See [ICU Collation: CaseLevel](https://unicode-org.github.io/icu/userguide/collation/concepts.html#caselevel)
    pub case_level: Option<bool>,

    /// The sort order of case differences during tertiary level comparisons.
    pub case_first: Option<String>,

    /// Whether to compare numeric strings as numbers or strings.
    pub numeric_ordering: Option<bool>,

    /// Whether collation should consider whitespace and punctuation as base
    /// characters for purposes of comparison.
    pub alternate: Option<String>,

    /// Up to which characters are considered ignorable when `alternate` is
    /// "shifted".
    pub max_variable: Option<String>,

    /// Whether to check if text requires normalization and to perform it.
    pub normalization: Option<bool>,

    /// Whether strings with diacritics sort from the back of the string.
    pub backwards: Option<bool>,
}
