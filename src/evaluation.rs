use serde::{Deserialize, Serialize};

/// A flag's pre-computed result for the current target.
///
/// Produced by the server and never mutated by the client: newer evaluations replace older ones
/// wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Identifier of the flag.
    #[serde(rename = "flag")]
    pub flag_identifier: String,
    /// String-encoded value of the served variation.
    pub value: String,
    /// Declared kind of the flag (`boolean`, `string`, `int`, `json`, ...).
    #[serde(default)]
    pub kind: String,
    /// Identifier of the served variation.
    #[serde(rename = "identifier")]
    pub variation_identifier: String,
}

impl Evaluation {
    /// Create an evaluation with an empty kind.
    pub fn new(
        flag_identifier: impl Into<String>,
        value: impl Into<String>,
        variation_identifier: impl Into<String>,
    ) -> Evaluation {
        Evaluation {
            flag_identifier: flag_identifier.into(),
            value: value.into(),
            kind: String::new(),
            variation_identifier: variation_identifier.into(),
        }
    }
}

/// A type a string-encoded evaluation value can be coerced into.
///
/// Coercion failure is not an error for the caller: the variation functions serve the default
/// value instead.
pub trait VariationValue: Sized {
    /// Name used in diagnostics ("failed to parse value as {KIND}").
    const KIND: &'static str;

    /// Parse a raw evaluation value.
    fn from_raw(raw: &str) -> Option<Self>;

    /// Render the value for diagnostics.
    fn describe(&self) -> String;
}

impl VariationValue for bool {
    const KIND: &'static str = "bool";

    fn from_raw(raw: &str) -> Option<bool> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            Some(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl VariationValue for String {
    const KIND: &'static str = "string";

    fn from_raw(raw: &str) -> Option<String> {
        Some(raw.to_owned())
    }

    fn describe(&self) -> String {
        self.clone()
    }
}

impl VariationValue for f64 {
    const KIND: &'static str = "number";

    fn from_raw(raw: &str) -> Option<f64> {
        raw.trim().parse().ok()
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl VariationValue for serde_json::Value {
    const KIND: &'static str = "json";

    fn from_raw(raw: &str) -> Option<serde_json::Value> {
        serde_json::from_str(raw).ok()
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Evaluation, VariationValue};

    #[test]
    fn parse_wire_evaluation() {
        let evaluation: Evaluation = serde_json::from_str(
            r#"{"flag":"dark-mode","value":"true","kind":"boolean","identifier":"on"}"#,
        )
        .unwrap();

        assert_eq!(evaluation.flag_identifier, "dark-mode");
        assert_eq!(evaluation.value, "true");
        assert_eq!(evaluation.kind, "boolean");
        assert_eq!(evaluation.variation_identifier, "on");
    }

    #[test]
    fn kind_is_optional() {
        let evaluation: Evaluation =
            serde_json::from_str(r#"{"flag":"f","value":"1","identifier":"one"}"#).unwrap();

        assert_eq!(evaluation.kind, "");
    }

    #[test]
    fn bool_coercion_is_case_insensitive() {
        assert_eq!(bool::from_raw("true"), Some(true));
        assert_eq!(bool::from_raw("False"), Some(false));
        assert_eq!(bool::from_raw("yes"), None);
    }

    #[test]
    fn number_coercion() {
        assert_eq!(f64::from_raw("42"), Some(42.0));
        assert_eq!(f64::from_raw(" 2.5 "), Some(2.5));
        assert_eq!(f64::from_raw("forty-two"), None);
    }

    #[test]
    fn json_coercion() {
        assert_eq!(
            serde_json::Value::from_raw(r#"{"theme":"dark"}"#),
            Some(json!({"theme": "dark"}))
        );
        assert_eq!(serde_json::Value::from_raw("{not json"), None);
    }
}
