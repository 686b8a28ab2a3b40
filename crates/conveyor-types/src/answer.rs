//! Operator answers submitted to resolve an interrupt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ConveyorError, Question, Result};

/// How a question expects to be answered.
///
/// Unrecognised answer types from the producer fall back to free text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnswerType {
    #[default]
    Text,
    Number,
    Boolean,
    Choice,
    MultiChoice,
}

impl From<String> for AnswerType {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "number" | "integer" | "numeric" => AnswerType::Number,
            "boolean" | "bool" | "yes_no" | "confirm" => AnswerType::Boolean,
            "choice" | "single_choice" | "select" | "radio" => AnswerType::Choice,
            "multi_choice" | "multi_select" | "multiselect" | "checkbox" => {
                AnswerType::MultiChoice
            }
            _ => AnswerType::Text,
        }
    }
}

impl From<AnswerType> for String {
    fn from(kind: AnswerType) -> Self {
        match kind {
            AnswerType::Text => "text",
            AnswerType::Number => "number",
            AnswerType::Boolean => "boolean",
            AnswerType::Choice => "choice",
            AnswerType::MultiChoice => "multi_choice",
        }
        .to_string()
    }
}

/// A single answer value. Serialized as the bare JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for AnswerValue {
    fn from(s: &str) -> Self {
        AnswerValue::Text(s.to_string())
    }
}

impl From<String> for AnswerValue {
    fn from(s: String) -> Self {
        AnswerValue::Text(s)
    }
}

impl From<bool> for AnswerValue {
    fn from(b: bool) -> Self {
        AnswerValue::Bool(b)
    }
}

impl From<f64> for AnswerValue {
    fn from(n: f64) -> Self {
        AnswerValue::Number(n)
    }
}

impl From<Vec<String>> for AnswerValue {
    fn from(items: Vec<String>) -> Self {
        AnswerValue::List(items)
    }
}

/// Question id → answer. Ordered so request bodies are stable.
pub type Answers = BTreeMap<String, AnswerValue>;

fn invalid(question: &str, message: impl Into<String>) -> ConveyorError {
    ConveyorError::InvalidAnswer {
        question: question.to_string(),
        message: message.into(),
    }
}

fn check_choice(question: &Question, value: &str) -> Result<()> {
    match &question.choices {
        Some(choices) if !choices.iter().any(|c| c == value) => Err(invalid(
            &question.id,
            format!("'{value}' is not one of the offered choices"),
        )),
        _ => Ok(()),
    }
}

fn check_value(question: &Question, value: &AnswerValue) -> Result<()> {
    match (question.answer_type, value) {
        (AnswerType::Text, AnswerValue::Text(text)) => {
            if question.required && text.trim().is_empty() {
                return Err(invalid(&question.id, "answer is required"));
            }
            Ok(())
        }
        (AnswerType::Number, AnswerValue::Number(n)) if n.is_finite() => Ok(()),
        (AnswerType::Boolean, AnswerValue::Bool(_)) => Ok(()),
        (AnswerType::Choice, AnswerValue::Text(choice)) => check_choice(question, choice),
        (AnswerType::MultiChoice, AnswerValue::List(items)) => {
            if question.required && items.is_empty() {
                return Err(invalid(&question.id, "at least one choice is required"));
            }
            items
                .iter()
                .try_for_each(|item| check_choice(question, item))
        }
        (expected, _) => Err(invalid(
            &question.id,
            format!("expected a {} answer", String::from(expected)),
        )),
    }
}

/// Check `answers` against the questions of an interrupt before submission.
///
/// Every required question must be answered, every answer must match its
/// question's answer type, and no answer may target a question that was not asked.
pub fn validate_answers(questions: &[Question], answers: &Answers) -> Result<()> {
    for question in questions {
        match answers.get(&question.id) {
            Some(value) => check_value(question, value)?,
            None if question.required => {
                return Err(invalid(&question.id, "answer is required"));
            }
            None => {}
        }
    }

    if let Some(unknown) = answers
        .keys()
        .find(|id| !questions.iter().any(|q| &q.id == *id))
    {
        return Err(invalid(unknown, "question was not asked"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, kind: AnswerType, required: bool, choices: Option<&[&str]>) -> Question {
        Question {
            id: id.into(),
            text: format!("Question {id}?"),
            required,
            answer_type: kind,
            choices: choices.map(|c| c.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn answer_type_accepts_producer_synonyms() {
        let kind: AnswerType = serde_json::from_str("\"multi-select\"").unwrap();
        assert_eq!(kind, AnswerType::MultiChoice);
        let kind: AnswerType = serde_json::from_str("\"yes_no\"").unwrap();
        assert_eq!(kind, AnswerType::Boolean);
        let kind: AnswerType = serde_json::from_str("\"free_form\"").unwrap();
        assert_eq!(kind, AnswerType::Text);
        assert_eq!(
            serde_json::to_string(&AnswerType::MultiChoice).unwrap(),
            "\"multi_choice\""
        );
    }

    #[test]
    fn answer_value_serializes_bare() {
        let mut answers = Answers::new();
        answers.insert("q1".into(), "answer".into());
        answers.insert("q2".into(), AnswerValue::Number(3.0));
        answers.insert("q3".into(), true.into());
        answers.insert("q4".into(), vec!["a".to_string(), "b".to_string()].into());
        let json = serde_json::to_string(&answers).unwrap();
        assert_eq!(json, r#"{"q1":"answer","q2":3.0,"q3":true,"q4":["a","b"]}"#);
    }

    #[test]
    fn answer_value_deserializes_by_shape() {
        let v: AnswerValue = serde_json::from_str("false").unwrap();
        assert_eq!(v, AnswerValue::Bool(false));
        let v: AnswerValue = serde_json::from_str("12").unwrap();
        assert_eq!(v, AnswerValue::Number(12.0));
        let v: AnswerValue = serde_json::from_str("[\"x\"]").unwrap();
        assert_eq!(v, AnswerValue::List(vec!["x".into()]));
    }

    #[test]
    fn missing_required_answer_is_rejected() {
        let questions = vec![question("q1", AnswerType::Text, true, None)];
        let err = validate_answers(&questions, &Answers::new()).unwrap_err();
        assert!(matches!(
            err,
            ConveyorError::InvalidAnswer { ref question, .. } if question == "q1"
        ));
    }

    #[test]
    fn optional_question_may_be_skipped() {
        let questions = vec![question("q1", AnswerType::Text, false, None)];
        assert!(validate_answers(&questions, &Answers::new()).is_ok());
    }

    #[test]
    fn blank_required_text_is_rejected() {
        let questions = vec![question("q1", AnswerType::Text, true, None)];
        let mut answers = Answers::new();
        answers.insert("q1".into(), "   ".into());
        assert!(validate_answers(&questions, &answers).is_err());
    }

    #[test]
    fn choice_must_be_offered() {
        let questions = vec![question(
            "tone",
            AnswerType::Choice,
            true,
            Some(&["formal", "casual"]),
        )];
        let mut answers = Answers::new();
        answers.insert("tone".into(), "formal".into());
        assert!(validate_answers(&questions, &answers).is_ok());

        answers.insert("tone".into(), "angry".into());
        assert!(validate_answers(&questions, &answers).is_err());
    }

    #[test]
    fn multi_choice_checks_every_item() {
        let questions = vec![question("tags", AnswerType::MultiChoice, true, Some(&["a", "b"]))];
        let mut answers = Answers::new();
        answers.insert("tags".into(), vec!["a".to_string(), "b".to_string()].into());
        assert!(validate_answers(&questions, &answers).is_ok());

        answers.insert("tags".into(), vec!["a".to_string(), "z".to_string()].into());
        assert!(validate_answers(&questions, &answers).is_err());

        answers.insert("tags".into(), AnswerValue::List(vec![]));
        assert!(validate_answers(&questions, &answers).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let questions = vec![question("budget", AnswerType::Number, true, None)];
        let mut answers = Answers::new();
        answers.insert("budget".into(), "a lot".into());
        let err = validate_answers(&questions, &answers).unwrap_err();
        assert!(err.to_string().contains("expected a number answer"));
    }

    #[test]
    fn answer_for_unasked_question_is_rejected() {
        let questions = vec![question("q1", AnswerType::Boolean, false, None)];
        let mut answers = Answers::new();
        answers.insert("q9".into(), true.into());
        let err = validate_answers(&questions, &answers).unwrap_err();
        assert!(err.to_string().contains("q9"));
    }
}
