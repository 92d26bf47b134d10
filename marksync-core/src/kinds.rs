//! Kind-equivalence classes.
//!
//! Kinds in the same class are mutually exclusive at one address: appending
//! any member supersedes every live member. Kinds that are not listed in a
//! group form their own singleton class.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::frame::MAX_KIND_CODE;
use crate::types::ChangeKind;

/// Configured groups of mutually exclusive kind codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindClasses {
    groups: Vec<Vec<u32>>,
}

impl Default for KindClasses {
    /// Regular and repeatable comments share one class.
    fn default() -> Self {
        Self {
            groups: vec![vec![
                ChangeKind::CommentRegular.code(),
                ChangeKind::CommentRepeatable.code(),
            ]],
        }
    }
}

impl KindClasses {
    /// Build from explicit groups, rejecting a code listed in two groups.
    pub fn new(groups: Vec<Vec<u32>>) -> Result<Self, ConfigError> {
        let classes = Self { groups };
        classes.validate()?;
        Ok(classes)
    }

    /// Every kind singleton; no cross-kind supersede.
    pub fn singletons() -> Self {
        Self { groups: vec![] }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            for code in group {
                if *code > MAX_KIND_CODE {
                    return Err(ConfigError::Invalid(format!(
                        "kind code {code} in exclusive_kind_groups exceeds {MAX_KIND_CODE}"
                    )));
                }
                if !seen.insert(*code) {
                    return Err(ConfigError::Invalid(format!(
                        "kind code {code} appears in more than one exclusive_kind_groups entry"
                    )));
                }
            }
        }
        Ok(())
    }

    /// All kinds that `kind` supersedes, itself included. Sorted, no duplicates.
    pub fn class_of(&self, kind: ChangeKind) -> Vec<ChangeKind> {
        let code = kind.code();
        let mut codes = self
            .groups
            .iter()
            .find(|group| group.contains(&code))
            .cloned()
            .unwrap_or_default();
        codes.push(code);
        codes.sort_unstable();
        codes.dedup();
        codes.into_iter().map(ChangeKind::from_code).collect()
    }

    pub fn same_class(&self, a: ChangeKind, b: ChangeKind) -> bool {
        self.class_of(a).contains(&b)
    }

    pub fn groups(&self) -> &[Vec<u32>] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_share_a_class_by_default() {
        let classes = KindClasses::default();
        assert_eq!(
            classes.class_of(ChangeKind::CommentRegular),
            vec![ChangeKind::CommentRegular, ChangeKind::CommentRepeatable]
        );
        assert!(classes.same_class(ChangeKind::CommentRepeatable, ChangeKind::CommentRegular));
        assert!(!classes.same_class(ChangeKind::Name, ChangeKind::CommentRegular));
    }

    #[test]
    fn ungrouped_kind_is_singleton() {
        let classes = KindClasses::default();
        assert_eq!(classes.class_of(ChangeKind::Name), vec![ChangeKind::Name]);
        assert_eq!(
            classes.class_of(ChangeKind::Other(77)),
            vec![ChangeKind::Other(77)]
        );
    }

    #[test]
    fn configured_function_boundaries_group() {
        let classes = KindClasses::new(vec![vec![3, 4], vec![5, 6]]).expect("valid groups");
        assert!(classes.same_class(ChangeKind::FunctionStart, ChangeKind::FunctionEnd));
        assert!(KindClasses::singletons().class_of(ChangeKind::CommentRegular).len() == 1);
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        let err = KindClasses::new(vec![vec![3, 4], vec![4, 5]]).unwrap_err();
        assert!(err.to_string().contains("kind code 4"), "got: {err}");
    }

    #[test]
    fn codes_outside_the_wire_range_are_rejected() {
        let err = KindClasses::new(vec![vec![3, 300]]).unwrap_err();
        assert!(err.to_string().contains("kind code 300"), "got: {err}");
    }
}
