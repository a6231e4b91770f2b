//! Participants and the structured verdict contract.
//!
//! The final arbiter must answer through the `get_argument_result` function,
//! whose parameters are the JSON schema of [`ArgumentResult`]. Replies are
//! decoded fail-closed: a missing or mistyped field, or a winner/loser that
//! does not name the two participants, rejects the whole run.

use std::collections::BTreeMap;

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ArbiterError;
use crate::llm::FunctionSpec;

/// Name of the function the arbiter is forced to call.
pub const VERDICT_FUNCTION_NAME: &str = "get_argument_result";
const VERDICT_FUNCTION_DESCRIPTION: &str = "Get the final result of the argument analysis";

/// One side of the dispute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    /// Free-text background about this person. May be empty.
    #[serde(default)]
    pub context: String,
}

impl Participant {
    pub fn new(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
        }
    }

    /// Whether `candidate` names this participant (trimmed, Unicode
    /// case-insensitive).
    pub fn is_named(&self, candidate: &str) -> bool {
        self.name.trim().to_lowercase() == candidate.trim().to_lowercase()
    }
}

/// A complete arbitration request, as accepted by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRequest {
    pub person1: Participant,
    pub person2: Participant,
    /// Newline-delimited transcript, one message per line.
    #[serde(default)]
    pub conversation: String,
}

/// Reject participant pairs that can never produce a valid verdict.
pub fn check_participants(person1: &Participant, person2: &Participant) -> Result<(), ArbiterError> {
    if person1.name.trim().is_empty() || person2.name.trim().is_empty() {
        return Err(ArbiterError::InvalidInput(
            "participant names must not be empty".to_string(),
        ));
    }
    if person1.is_named(&person2.name) {
        return Err(ArbiterError::InvalidInput(format!(
            "participants must have distinct names, both are '{}'",
            person1.name.trim()
        )));
    }
    Ok(())
}

/// Final verdict on a dispute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArgumentResult {
    /// Name of the participant who won the argument.
    pub winner: String,
    /// Logical consistency score of the winner, 0-100.
    #[serde(deserialize_with = "lax::score")]
    pub winner_logical_score: f64,
    /// One or two words describing the winner's tone.
    pub winner_tonality: String,
    /// Number of messages the winner sent.
    #[serde(deserialize_with = "lax::count")]
    pub winner_count: u32,
    /// Personal attacks made by the winner, keyed by the winner's name.
    pub winner_personal_attacks: BTreeMap<String, Vec<String>>,
    /// Why the winner won.
    pub winner_explanation: String,
    /// Name of the participant who lost the argument.
    pub loser: String,
    /// Logical consistency score of the loser, 0-100.
    #[serde(deserialize_with = "lax::score")]
    pub loser_logical_score: f64,
    /// One or two words describing the loser's tone.
    pub loser_tonality: String,
    /// Number of messages the loser sent.
    #[serde(deserialize_with = "lax::count")]
    pub loser_count: u32,
    /// Personal attacks made by the loser, keyed by the loser's name.
    pub loser_personal_attacks: BTreeMap<String, Vec<String>>,
    /// Why the loser lost.
    pub loser_explanation: String,
}

impl ArgumentResult {
    /// Inlined JSON schema suitable for a function-call `parameters` block.
    pub fn parameters_schema() -> Value {
        let generator = SchemaSettings::draft07()
            .with(|s| s.inline_subschemas = true)
            .into_generator();
        let root = generator.into_root_schema_for::<ArgumentResult>();
        let mut schema = serde_json::to_value(root).unwrap_or(Value::Null);
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
        }
        schema
    }

    /// The forced function-call contract for the final arbiter.
    pub fn function_spec() -> FunctionSpec {
        FunctionSpec {
            name: VERDICT_FUNCTION_NAME.to_string(),
            description: VERDICT_FUNCTION_DESCRIPTION.to_string(),
            parameters: Self::parameters_schema(),
        }
    }

    /// Validate a generic JSON value into a verdict for these participants.
    ///
    /// On success `winner` and `loser` are rewritten to the participants'
    /// exact names.
    pub fn from_value(
        value: Value,
        person1: &Participant,
        person2: &Participant,
    ) -> Result<Self, ArbiterError> {
        let mut result: Self =
            serde_json::from_value(value).map_err(|e| ArbiterError::Schema(e.to_string()))?;
        result.resolve_sides(person1, person2)?;
        Ok(result)
    }

    /// Parse and validate terminal message text.
    pub fn from_json_str(
        raw: &str,
        person1: &Participant,
        person2: &Participant,
    ) -> Result<Self, ArbiterError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ArbiterError::InvalidJson(e.to_string()))?;
        Self::from_value(value, person1, person2)
    }

    fn resolve_sides(
        &mut self,
        person1: &Participant,
        person2: &Participant,
    ) -> Result<(), ArbiterError> {
        let resolve = |role: &str, side: &str| -> Result<String, ArbiterError> {
            [person1, person2]
                .into_iter()
                .find(|p| p.is_named(side))
                .map(|p| p.name.clone())
                .ok_or_else(|| {
                    ArbiterError::Schema(format!(
                        "{role} '{side}' is neither '{}' nor '{}'",
                        person1.name, person2.name
                    ))
                })
        };

        let winner = resolve("winner", &self.winner)?;
        let loser = resolve("loser", &self.loser)?;
        if winner == loser {
            return Err(ArbiterError::Schema(format!(
                "winner and loser are both '{winner}'"
            )));
        }
        self.winner = winner;
        self.loser = loser;
        Ok(())
    }
}

/// Lenient numeric decoding for model-produced payloads: whole-number floats
/// and numeric strings are accepted where the schema asks for numbers.
mod lax {
    use serde::de::{Deserializer, Error};
    use serde::Deserialize;
    use serde_json::Value;

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let number = match &value {
            Value::Number(n) => n.as_u64().map(|u| u as f64).or_else(|| n.as_f64()),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => {
                Ok(n as u32)
            }
            _ => Err(D::Error::custom(format!(
                "expected a non-negative whole number, got {value}"
            ))),
        }
    }

    pub fn score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let number = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n.is_finite() => Ok(n),
            _ => Err(D::Error::custom(format!("expected a number, got {value}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::ErrorKind;

    fn maya() -> Participant {
        Participant::new("Maya", "Feels unappreciated at home")
    }

    fn arjun() -> Participant {
        Participant::new("Arjun", "Works long hours")
    }

    fn payload() -> Value {
        json!({
            "winner": "Maya",
            "winner_logical_score": 60,
            "winner_tonality": "Frustrated",
            "winner_count": 27,
            "winner_personal_attacks": {"Maya": ["You only put in effort when it benefits you."]},
            "winner_explanation": "Maya stated her needs clearly.",
            "loser": "Arjun",
            "loser_logical_score": 55,
            "loser_tonality": "Defensive",
            "loser_count": 25,
            "loser_personal_attacks": {"Arjun": ["Maybe because you celebrate enough for both of us?"]},
            "loser_explanation": "Arjun stayed defensive."
        })
    }

    #[test]
    fn decodes_valid_payload() {
        let result = ArgumentResult::from_value(payload(), &maya(), &arjun()).unwrap();
        assert_eq!(result.winner, "Maya");
        assert_eq!(result.winner_logical_score, 60.0);
        assert_eq!(result.loser_count, 25);
        assert_eq!(result.winner_personal_attacks["Maya"].len(), 1);
    }

    #[test]
    fn missing_field_is_schema_error() {
        let mut value = payload();
        value.as_object_mut().unwrap().remove("winner_logical_score");
        let err = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.to_string().contains("winner_logical_score"));
    }

    #[test]
    fn mistyped_field_is_schema_error() {
        let mut value = payload();
        value["loser_count"] = json!("twenty-five");
        let err = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn negative_count_is_schema_error() {
        let mut value = payload();
        value["winner_count"] = json!(-1);
        assert!(ArgumentResult::from_value(value, &maya(), &arjun()).is_err());
    }

    #[test]
    fn unknown_winner_rejected() {
        let mut value = payload();
        value["winner"] = json!("Priya");
        let err = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap_err();
        assert!(err.to_string().contains("Priya"));
    }

    #[test]
    fn winner_equal_to_loser_rejected() {
        let mut value = payload();
        value["loser"] = json!("maya");
        let err = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn side_names_are_canonicalized() {
        let mut value = payload();
        value["winner"] = json!(" MAYA ");
        value["loser"] = json!("arjun");
        let result = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap();
        assert_eq!(result.winner, "Maya");
        assert_eq!(result.loser, "Arjun");
    }

    #[test]
    fn non_ascii_names_fold_case() {
        let omer = Participant::new("Ömer", "");
        let mut value = payload();
        value["winner"] = json!("ömer");
        value["winner_personal_attacks"] = json!({"Ömer": []});
        let result = ArgumentResult::from_value(value, &omer, &arjun()).unwrap();
        assert_eq!(result.winner, "Ömer");
    }

    #[test]
    fn whole_float_and_numeric_string_counts_accepted() {
        let mut value = payload();
        value["winner_count"] = json!(27.0);
        value["loser_count"] = json!(" 25 ");
        let result = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap();
        assert_eq!(result.winner_count, 27);
        assert_eq!(result.loser_count, 25);
    }

    #[test]
    fn numeric_string_scores_accepted() {
        let mut value = payload();
        value["winner_logical_score"] = json!("60");
        value["loser_logical_score"] = json!("55.5");
        let result = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap();
        assert_eq!(result.winner_logical_score, 60.0);
        assert_eq!(result.loser_logical_score, 55.5);
    }

    #[test]
    fn fractional_or_non_numeric_values_rejected() {
        for (field, bad) in [
            ("winner_count", json!(27.5)),
            ("loser_count", json!("2.5")),
            ("winner_logical_score", json!("sixty")),
            ("loser_logical_score", json!(true)),
        ] {
            let mut value = payload();
            value[field] = bad;
            let err = ArgumentResult::from_value(value, &maya(), &arjun()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Schema, "{field} was accepted");
        }
    }

    #[test]
    fn non_json_text_is_decode_error() {
        let err = ArgumentResult::from_json_str("Maya wins.", &maya(), &arjun()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn serialized_result_round_trips_through_validator() {
        let result = ArgumentResult::from_value(payload(), &maya(), &arjun()).unwrap();
        let text = serde_json::to_string(&result).unwrap();
        let again = ArgumentResult::from_json_str(&text, &maya(), &arjun()).unwrap();
        assert_eq!(result, again);
    }

    #[test]
    fn schema_lists_every_field_as_required() {
        let schema = ArgumentResult::parameters_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required.len(), 12);
        assert!(required.contains(&"winner_personal_attacks"));
        assert_eq!(schema["properties"]["winner_count"]["type"], "integer");
        assert_eq!(
            schema["properties"]["loser_personal_attacks"]["type"],
            "object"
        );
    }

    #[test]
    fn function_spec_uses_contract_name() {
        let spec = ArgumentResult::function_spec();
        assert_eq!(spec.name, VERDICT_FUNCTION_NAME);
        assert!(!spec.description.is_empty());
    }

    #[test]
    fn participant_checks() {
        assert!(check_participants(&maya(), &arjun()).is_ok());
        assert!(check_participants(&maya(), &Participant::new(" ", "")).is_err());
        assert!(check_participants(&maya(), &Participant::new("MAYA", "")).is_err());
    }

    #[test]
    fn dispute_request_defaults_conversation() {
        let req: DisputeRequest = serde_json::from_value(json!({
            "person1": {"name": "Maya", "context": ""},
            "person2": {"name": "Arjun"}
        }))
        .unwrap();
        assert_eq!(req.conversation, "");
        assert_eq!(req.person2.context, "");
    }
}
