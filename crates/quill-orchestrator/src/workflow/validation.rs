//! Built-in output validators.
//!
//! The quality validation pass over a workflow's aggregated output is
//! policy-defined and pluggable (`OutputValidator` in the abstraction crate).
//! These are the stock checks; deployments compose their own.

use quill_abstraction::{OutputValidator, ValidationViolation};

/// Rejects output shorter than a minimum character count.
#[derive(Debug, Clone)]
pub struct MinLengthValidator {
    min_chars: usize,
}

impl MinLengthValidator {
    /// Creates a validator with the given minimum length.
    #[must_use]
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl OutputValidator for MinLengthValidator {
    fn validate(&self, output: &str) -> Vec<ValidationViolation> {
        let len = output.trim().chars().count();
        if len < self.min_chars {
            vec![ValidationViolation::new(
                "min-length",
                format!("output is {} characters, minimum is {}", len, self.min_chars),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Rejects output containing unfinished-draft markers.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderValidator;

impl PlaceholderValidator {
    const MARKERS: [&'static str; 4] = ["todo", "tbd", "[placeholder]", "lorem ipsum"];
}

impl OutputValidator for PlaceholderValidator {
    fn validate(&self, output: &str) -> Vec<ValidationViolation> {
        let lower = output.to_lowercase();
        Self::MARKERS
            .iter()
            .filter(|marker| lower.contains(*marker))
            .map(|marker| {
                ValidationViolation::new("placeholder", format!("output contains '{}'", marker))
            })
            .collect()
    }
}

/// Runs several validators and concatenates their violations.
#[derive(Default)]
pub struct CompositeValidator {
    validators: Vec<Box<dyn OutputValidator>>,
}

impl CompositeValidator {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self { validators: Vec::new() }
    }

    /// Adds a validator.
    #[must_use]
    pub fn with(mut self, validator: Box<dyn OutputValidator>) -> Self {
        self.validators.push(validator);
        self
    }
}

impl OutputValidator for CompositeValidator {
    fn validate(&self, output: &str) -> Vec<ValidationViolation> {
        self.validators.iter().flat_map(|v| v.validate(output)).collect()
    }
}

/// Accepts everything. Useful for tests and permissive deployments.
#[derive(Debug, Clone, Default)]
pub struct AcceptAllValidator;

impl OutputValidator for AcceptAllValidator {
    fn validate(&self, _output: &str) -> Vec<ValidationViolation> {
        Vec::new()
    }
}
