//! Validation engine.
//!
//! Runs every rule over a resolved application type and collects all
//! violations instead of stopping at the first one. Per-service rules run
//! independently, optionally on scoped worker threads; application-level
//! rules run after all of them have finished.

mod application;
mod policies;
mod service;

pub use application::{is_valid_dns_name, validate_application_rules};
pub use service::validate_service;

use crate::digest::ServiceSource;
use imagebuilder_schema::ApplicationManifest;
use std::fmt;
use thiserror::Error;

/// Category of a validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Rule {
    UndeclaredParameter,
    MissingRequiredValue,
    DanglingReference,
    DuplicateDefinition,
    InvalidValue,
    PolicyConflict,
    StructuralIncomplete,
    EncryptionIncoherent,
    DnsName,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::UndeclaredParameter => "UndeclaredParameter",
            Rule::MissingRequiredValue => "MissingRequiredValue",
            Rule::DanglingReference => "DanglingReference",
            Rule::DuplicateDefinition => "DuplicateDefinition",
            Rule::InvalidValue => "InvalidValue",
            Rule::PolicyConflict => "PolicyConflict",
            Rule::StructuralIncomplete => "StructuralIncomplete",
            Rule::EncryptionIncoherent => "EncryptionIncoherent",
            Rule::DnsName => "DnsName",
        };
        f.write_str(name)
    }
}

/// One broken rule: which rule, which element, and why.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub rule: Rule,
    pub element: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.element, self.message)
    }
}

/// Collector handed through the rules.
#[derive(Debug, Default)]
pub struct Violations {
    items: Vec<Violation>,
}

impl Violations {
    pub fn push(&mut self, rule: Rule, element: impl Into<String>, message: impl Into<String>) {
        self.items.push(Violation {
            rule,
            element: element.into(),
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: Violations) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.items.iter()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                violations: self.items,
            })
        }
    }
}

/// Every violation found while validating one build.
#[derive(Debug, Default, Error)]
#[error("validation failed with {} violation(s): {}", .violations.len(), summarize(.violations))]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn has_rule(&self, rule: Rule) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run the full rule battery over a resolved application type.
pub fn validate_all(
    app: &ApplicationManifest,
    services: &[ServiceSource],
    parallel: bool,
    violations: &mut Violations,
) {
    if parallel && services.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = services
                .iter()
                .map(|svc| scope.spawn(move || validate_service(app, svc)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(found) => violations.extend(found),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });
    } else {
        for svc in services {
            violations.extend(validate_service(app, svc));
        }
    }

    validate_application_rules(app, services, violations);
}

/// Names that occur more than once, each reported once, in first-seen order.
pub(crate) fn find_duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = std::collections::HashSet::new();
    let mut dups = Vec::new();
    for name in names {
        if !seen.insert(name) && !dups.contains(&name) {
            dups.push(name);
        }
    }
    dups
}

/// Strict boolean parse used for `is_encrypted` style attributes.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
