//! A small model-formula language: `OUTCOME ~ a + C(b) + c`.
//!
//! A bare name is a numeric predictor and `C(name)` a categorical one. The
//! intercept is implicit; a literal `1` term is accepted and ignored.

use crate::shared::frame::FrameError;
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("Formula '{0}' has no '~' separating the outcome from the predictors.")]
    MissingTilde(String),
    #[error("Formula '{0}' names no outcome.")]
    MissingOutcome(String),
    #[error("Malformed formula term '{0}'.")]
    MalformedTerm(String),
    #[error("Column '{0}' is not numeric; wrap it in C() to treat it as categorical.")]
    NotNumeric(String),
    #[error("No complete rows remain for '{0}' after dropping missing values.")]
    NoCompleteRows(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Numeric(String),
    Categorical(String),
}

impl Term {
    pub fn column(&self) -> &str {
        match self {
            Term::Numeric(name) | Term::Categorical(name) => name,
        }
    }

    /// Parses one term; `Ok(None)` for the explicit intercept `1`.
    fn parse(text: &str) -> Result<Option<Self>, FormulaError> {
        let text = text.trim();
        if text == "1" {
            return Ok(None);
        }
        let valid = |name: &str| {
            !name.is_empty()
                && !name
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '~' | '+' | ','))
        };
        if let Some(inner) = text.strip_prefix("C(").and_then(|rest| rest.strip_suffix(')')) {
            let inner = inner.trim();
            if valid(inner) {
                return Ok(Some(Term::Categorical(inner.to_string())));
            }
        } else if valid(text) {
            return Ok(Some(Term::Numeric(text.to_string())));
        }
        Err(FormulaError::MalformedTerm(text.to_string()))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Numeric(name) => write!(f, "{name}"),
            Term::Categorical(name) => write!(f, "C({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub outcome: String,
    pub terms: Vec<Term>,
}

/// Splits `a + C(b) + c` into terms, skipping empty pieces.
fn parse_terms(text: &str) -> Result<Vec<Term>, FormulaError> {
    let mut terms = Vec::new();
    for piece in text.split('+').map(str::trim).filter(|piece| !piece.is_empty()) {
        if let Some(term) = Term::parse(piece)? {
            terms.push(term);
        }
    }
    Ok(terms)
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        let (outcome, rhs) = text
            .split_once('~')
            .ok_or_else(|| FormulaError::MissingTilde(text.to_string()))?;
        let outcome = outcome.trim();
        if outcome.is_empty() {
            return Err(FormulaError::MissingOutcome(text.to_string()));
        }
        let mut formula = Self {
            outcome: outcome.to_string(),
            terms: Vec::new(),
        };
        formula.extend(parse_terms(rhs)?);
        Ok(formula)
    }

    /// An intercept-only formula.
    pub fn null(outcome: &str) -> Self {
        Self {
            outcome: outcome.to_string(),
            terms: Vec::new(),
        }
    }

    /// Appends terms given as `a + C(b)` fragments.
    pub fn with_fragments(&self, fragments: &[String]) -> Result<Self, FormulaError> {
        let mut formula = self.clone();
        for fragment in fragments {
            formula.extend(parse_terms(fragment)?);
        }
        Ok(formula)
    }

    /// Appends numeric terms, e.g. component score columns.
    pub fn with_numeric<I, S>(&self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut formula = self.clone();
        formula.extend(columns.into_iter().map(|c| Term::Numeric(c.into())));
        formula
    }

    /// Adds terms whose column is not yet referenced.
    fn extend(&mut self, terms: impl IntoIterator<Item = Term>) {
        for term in terms {
            if !self.terms.iter().any(|t| t.column() == term.column()) {
                self.terms.push(term);
            }
        }
    }

    /// Every column the formula reads, outcome first.
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(self.outcome.as_str())
            .chain(self.terms.iter().map(Term::column))
            .collect()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            write!(f, "{} ~ 1", self.outcome)
        } else {
            write!(f, "{} ~ {}", self.outcome, self.terms.iter().join(" + "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_categorical_terms() {
        let formula = Formula::parse("ACADEMIC_RESILIENCE ~ AGE + C(ST004D01T) + 1 + C( CNT )").unwrap();
        assert_eq!(formula.outcome, "ACADEMIC_RESILIENCE");
        assert_eq!(
            formula.terms,
            vec![
                Term::Numeric("AGE".into()),
                Term::Categorical("ST004D01T".into()),
                Term::Categorical("CNT".into()),
            ]
        );
        assert_eq!(
            formula.to_string(),
            "ACADEMIC_RESILIENCE ~ AGE + C(ST004D01T) + C(CNT)"
        );
    }

    #[test]
    fn repeated_columns_are_kept_once() {
        let base = Formula::parse("Y ~ AGE").unwrap();
        let extended = base
            .with_fragments(&["AGE + C(IMMIG)".to_string()])
            .unwrap()
            .with_numeric(["Block_PC1", "AGE"]);
        assert_eq!(extended.columns(), vec!["Y", "AGE", "IMMIG", "Block_PC1"]);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(Formula::parse("Y AGE"), Err(FormulaError::MissingTilde(_))));
        assert!(matches!(Formula::parse(" ~ AGE"), Err(FormulaError::MissingOutcome(_))));
        assert!(matches!(Formula::parse("Y ~ C(AGE"), Err(FormulaError::MalformedTerm(_))));
        assert_eq!(Formula::parse("Y ~ 1").unwrap(), Formula::null("Y"));
    }
}
